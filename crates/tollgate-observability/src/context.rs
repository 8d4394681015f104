use tracing::Level;

use crate::{emit_event, ObservabilityEvent, ProcessKind};

/// Logging context for a single dispatch.
///
/// Built by the dispatcher when an event arrives and handed (cloned, narrowed
/// with [`LogContext::for_handler`]) to every handler invocation, so every line
/// carries the dispatch id, session and handler without a global registry.
#[derive(Debug, Clone)]
pub struct LogContext {
    process: ProcessKind,
    component: &'static str,
    dispatch_id: String,
    session_id: String,
    event_kind: String,
    action: String,
    handler: Option<String>,
}

impl LogContext {
    pub fn new(
        process: ProcessKind,
        dispatch_id: impl Into<String>,
        session_id: impl Into<String>,
        event_kind: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            process,
            component: "dispatcher",
            dispatch_id: dispatch_id.into(),
            session_id: session_id.into(),
            event_kind: event_kind.into(),
            action: action.into(),
            handler: None,
        }
    }

    /// Context for code running outside of any dispatch (CLI commands, tests).
    pub fn detached(process: ProcessKind) -> Self {
        Self::new(process, "", "", "", "")
    }

    pub fn for_handler(&self, handler: &str) -> Self {
        Self {
            component: "handler",
            handler: Some(handler.to_string()),
            ..self.clone()
        }
    }

    pub fn dispatch_id(&self) -> &str {
        &self.dispatch_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn handler(&self) -> Option<&str> {
        self.handler.as_deref()
    }

    pub fn process(&self) -> ProcessKind {
        self.process
    }

    pub fn info(&self, event: &str, status: &str, detail: &str) {
        self.emit(Level::INFO, event, None, Some(status), None, detail);
    }

    pub fn debug(&self, event: &str, status: &str, detail: &str) {
        self.emit(Level::DEBUG, event, None, Some(status), None, detail);
    }

    pub fn warn(&self, event: &str, error_code: &str, detail: &str) {
        self.emit(Level::WARN, event, None, Some("degraded"), Some(error_code), detail);
    }

    /// Pool-related event; the pool name gets its own field.
    pub fn pool_event(&self, level: Level, event: &str, pool: &str, status: &str, detail: &str) {
        self.emit(level, event, Some(pool), Some(status), None, detail);
    }

    fn emit(
        &self,
        level: Level,
        event: &str,
        pool: Option<&str>,
        status: Option<&str>,
        error_code: Option<&str>,
        detail: &str,
    ) {
        emit_event(
            level,
            self.process,
            ObservabilityEvent {
                event,
                component: self.component,
                dispatch_id: non_empty(&self.dispatch_id),
                session_id: non_empty(&self.session_id),
                event_kind: non_empty(&self.event_kind),
                action: non_empty(&self.action),
                handler: self.handler.as_deref(),
                pool,
                status,
                error_code,
                detail: non_empty(detail),
            },
        );
    }
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
