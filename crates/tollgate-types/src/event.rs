use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Phase of the intercepted action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    #[serde(
        rename = "pre-action",
        alias = "pre_action",
        alias = "PreToolUse",
        alias = "pre"
    )]
    PreAction,
    #[serde(
        rename = "post-action",
        alias = "post_action",
        alias = "PostToolUse",
        alias = "post"
    )]
    PostAction,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PreAction => "pre-action",
            EventKind::PostAction => "post-action",
        }
    }

    /// Lenient parse used by the CLI and env overrides.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "pre-action" | "pre" | "pretooluse" => Some(EventKind::PreAction),
            "post-action" | "post" | "posttooluse" => Some(EventKind::PostAction),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event handed over by the agent runtime.
///
/// Accepts both the camelCase field names and the runtime's native hook
/// payload names (`hook_event_name`, `tool_name`, `tool_input`, `session_id`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookEvent {
    #[serde(alias = "hook_event_name", alias = "event_type", alias = "event_kind")]
    pub event_kind: EventKind,
    #[serde(alias = "tool_name", alias = "action_name")]
    pub action_name: String,
    #[serde(default, alias = "tool_input", alias = "action_payload")]
    pub action_payload: Value,
    #[serde(default, alias = "session_id")]
    pub session_id: String,
}

impl HookEvent {
    pub fn new(
        event_kind: EventKind,
        action_name: impl Into<String>,
        action_payload: Value,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            event_kind,
            action_name: action_name.into(),
            action_payload,
            session_id: session_id.into(),
        }
    }

    /// String field of the payload, e.g. `file_path` or `command`.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.action_payload.get(field).and_then(Value::as_str)
    }

    /// The payload in the runtime's native shape, used when forwarding the
    /// event to an external tool.
    pub fn to_runtime_json(&self) -> Value {
        serde_json::json!({
            "hook_event_name": match self.event_kind {
                EventKind::PreAction => "PreToolUse",
                EventKind::PostAction => "PostToolUse",
            },
            "tool_name": self.action_name,
            "tool_input": self.action_payload,
            "session_id": self.session_id,
        })
    }
}
