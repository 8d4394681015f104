// Tollgate Error Types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TollgateError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource pool `{pool}` exhausted after waiting {waited_ms}ms")]
    ResourceExhausted { pool: String, waited_ms: u64 },

    #[error("tool `{0}` is unavailable")]
    ToolUnavailable(String),

    #[error("handler failure: {0}")]
    HandlerFailure(String),

    #[error("handler exceeded its {budget_ms}ms budget")]
    TimeoutExceeded { budget_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TollgateError {
    /// Stable code used in structured log events.
    pub fn code(&self) -> &'static str {
        match self {
            TollgateError::Config(_) => "CONFIG_ERROR",
            TollgateError::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            TollgateError::ToolUnavailable(_) => "TOOL_UNAVAILABLE",
            TollgateError::HandlerFailure(_) => "HANDLER_FAILURE",
            TollgateError::TimeoutExceeded { .. } => "TIMEOUT_EXCEEDED",
            TollgateError::Io(_) => "IO_ERROR",
            TollgateError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<serde_yaml::Error> for TollgateError {
    fn from(err: serde_yaml::Error) -> Self {
        TollgateError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TollgateError>;
