use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::EventKind;

/// What a failed or timed-out handler counts as in the aggregate decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    #[default]
    Open,
    Closed,
}

impl FailPolicy {
    /// Effective continue-flag for a handler that did not complete.
    pub fn allows_on_failure(self) -> bool {
        matches!(self, FailPolicy::Open)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailPolicy::Open => "open",
            FailPolicy::Closed => "closed",
        }
    }
}

/// Lifecycle of one handler invocation inside a dispatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Pending,
    Acquiring,
    Running,
    Completed,
    TimedOut,
    Failed,
    Released,
}

impl InvocationState {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationState::Pending => "pending",
            InvocationState::Acquiring => "acquiring",
            InvocationState::Running => "running",
            InvocationState::Completed => "completed",
            InvocationState::TimedOut => "timed_out",
            InvocationState::Failed => "failed",
            InvocationState::Released => "released",
        }
    }
}

/// Result of one handler for one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub handler_name: String,
    #[serde(rename = "continue")]
    pub proceed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub state: InvocationState,
    pub fail_policy: FailPolicy,
}

impl DispatchOutcome {
    /// Diagnostic line for this handler, tagged with its name. `None` when the
    /// handler had nothing to say.
    pub fn diagnostic(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(message) = self.message.as_deref().map(str::trim) {
            if !message.is_empty() {
                parts.push(message.to_string());
            }
        }
        if let Some(error) = self.error.as_deref() {
            let verdict = if self.proceed { "allowed" } else { "blocked" };
            parts.push(format!(
                "{}: {} ({} by fail policy `{}`)",
                self.state.as_str(),
                error,
                verdict,
                self.fail_policy.as_str()
            ));
        }
        if parts.is_empty() {
            return None;
        }
        Some(format!("[{}] {}", self.handler_name, parts.join(" ")))
    }
}

/// Aggregated result of one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub dispatch_id: String,
    pub event_kind: EventKind,
    pub action_name: String,
    pub session_id: String,
    #[serde(rename = "continue")]
    pub proceed: bool,
    pub outcomes: Vec<DispatchOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl DispatchReport {
    /// Handler diagnostics in invocation order followed by dispatch warnings.
    pub fn diagnostics(&self) -> String {
        let mut lines = self
            .outcomes
            .iter()
            .filter_map(DispatchOutcome::diagnostic)
            .collect::<Vec<_>>();
        lines.extend(self.warnings.iter().map(|w| format!("[tollgate] {w}")));
        lines.join("\n")
    }

    /// `0` to let the action proceed, `2` when at least one handler blocked.
    pub fn exit_code(&self) -> i32 {
        if self.proceed {
            0
        } else {
            2
        }
    }

    pub fn blocking_handlers(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.proceed)
            .map(|o| o.handler_name.as_str())
            .collect()
    }
}
