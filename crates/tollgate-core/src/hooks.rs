//! Handler contract for the dispatch pipeline.
//!
//! A `HookHandler` looks at one lifecycle event and answers whether the agent
//! may continue. Handlers never see each other: the dispatcher runs every
//! matching handler concurrently and folds the verdicts together.
//!
//! # Example
//! ```rust,ignore
//! struct NoForcePush;
//!
//! #[async_trait::async_trait]
//! impl HookHandler for NoForcePush {
//!     fn name(&self) -> &str { "no_force_push" }
//!
//!     async fn evaluate(&self, event: &HookEvent, _ctx: &HookContext) -> anyhow::Result<HookVerdict> {
//!         match event.payload_str("command") {
//!             Some(cmd) if cmd.contains("push --force") => Ok(HookVerdict::block("force push is not allowed")),
//!             _ => Ok(HookVerdict::allow()),
//!         }
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tollgate_observability::LogContext;
use tollgate_types::HookEvent;

use crate::resolver::ToolResolver;

// ---------------------------------------------------------------------------
// HookVerdict
// ---------------------------------------------------------------------------

/// What a handler decided. `message` is surfaced to the agent either way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookVerdict {
    #[serde(rename = "continue")]
    pub proceed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HookVerdict {
    pub fn allow() -> Self {
        Self {
            proceed: true,
            message: None,
        }
    }

    pub fn allow_with(message: impl Into<String>) -> Self {
        Self {
            proceed: true,
            message: Some(message.into()),
        }
    }

    pub fn block(message: impl Into<String>) -> Self {
        Self {
            proceed: false,
            message: Some(message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// HookContext
// ---------------------------------------------------------------------------

/// Everything a handler may use besides the event itself.
#[derive(Clone)]
pub struct HookContext {
    pub log: LogContext,
    pub tools: ToolResolver,
    /// The handler config (inline `config` merged with `configRef`), or `null`.
    pub config: Value,
}

impl HookContext {
    pub fn new(log: LogContext, tools: ToolResolver, config: Value) -> Self {
        Self { log, tools, config }
    }
}

// ---------------------------------------------------------------------------
// HookHandler trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait HookHandler: Send + Sync {
    /// Unique name for logging and diagnostics.
    fn name(&self) -> &str;

    /// Decide on one event. An `Err` counts as a failed invocation and is
    /// settled by the handler's fail policy.
    async fn evaluate(&self, event: &HookEvent, ctx: &HookContext) -> anyhow::Result<HookVerdict>;
}
