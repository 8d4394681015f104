use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tollgate_observability::{redact_text, LogContext, ProcessKind};
use tollgate_types::{DispatchOutcome, DispatchReport, HookEvent, InvocationState};
use tracing::Level;
use uuid::Uuid;

use crate::config::DispatchSettings;
use crate::error::TollgateError;
use crate::hooks::{HookContext, HookVerdict};
use crate::pool::ResourcePoolManager;
use crate::registry::{HandlerDescriptor, HandlerFactory, RegistryLoader};
use crate::resolver::ToolResolver;
use crate::storage_paths::StatePaths;

/// How one invocation ended, before the fail policy is applied.
struct Settled {
    state: InvocationState,
    verdict: Option<HookVerdict>,
    error: Option<String>,
    error_code: &'static str,
}

impl Settled {
    fn completed(verdict: HookVerdict) -> Self {
        Self {
            state: InvocationState::Completed,
            verdict: Some(verdict),
            error: None,
            error_code: "",
        }
    }

    fn failed(error_code: &'static str, error: impl Into<String>) -> Self {
        Self {
            state: InvocationState::Failed,
            verdict: None,
            error: Some(error.into()),
            error_code,
        }
    }

    fn timed_out(err: TollgateError) -> Self {
        Self {
            state: InvocationState::TimedOut,
            verdict: None,
            error: Some(err.to_string()),
            error_code: err.code(),
        }
    }
}

/// Runs every matching handler for one event and folds the verdicts.
#[derive(Clone)]
pub struct Dispatcher {
    registry: RegistryLoader,
    pools: ResourcePoolManager,
    tools: ToolResolver,
    settings: Arc<DispatchSettings>,
    process: ProcessKind,
}

impl Dispatcher {
    pub fn new(
        registry: RegistryLoader,
        pools: ResourcePoolManager,
        tools: ToolResolver,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            registry,
            pools,
            tools,
            settings: Arc::new(settings),
            process: ProcessKind::Dispatch,
        }
    }

    /// Wire the default components from settings and the state layout.
    pub fn from_settings(
        settings: DispatchSettings,
        paths: &StatePaths,
        project_root: &Path,
        factory: HandlerFactory,
    ) -> Self {
        let registry = RegistryLoader::new(
            settings.catalog_path.clone(),
            settings.default_handler_timeout(),
            factory,
        );
        let pools = ResourcePoolManager::from_settings(&settings, paths);
        let tools = ToolResolver::from_settings(&settings, paths, project_root);
        Self::new(registry, pools, tools, settings)
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    pub fn registry(&self) -> &RegistryLoader {
        &self.registry
    }

    pub fn pools(&self) -> &ResourcePoolManager {
        &self.pools
    }

    pub fn tools(&self) -> &ToolResolver {
        &self.tools
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Never fails: catalog problems and handler failures end up in the
    /// report as warnings and outcomes.
    pub async fn dispatch(&self, event: HookEvent) -> DispatchReport {
        let event = Arc::new(event);
        let dispatch_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();
        let log = LogContext::new(
            self.process,
            dispatch_id.clone(),
            event.session_id.clone(),
            event.event_kind.as_str(),
            event.action_name.clone(),
        );
        log.info(
            "dispatch.received",
            "pending",
            &redact_text(&event.action_payload.to_string()),
        );

        let mut warnings = Vec::new();
        let handlers = match self.registry.active_handlers(event.event_kind).await {
            Ok(selection) => {
                warnings.extend(selection.warnings);
                selection.handlers
            }
            Err(err) => {
                log.warn("dispatch.catalog_error", err.code(), &err.to_string());
                warnings.push(format!("handler catalog ignored: {err}"));
                Vec::new()
            }
        };
        let handlers = handlers
            .into_iter()
            .filter(|descriptor| descriptor.matches_action(&event.action_name))
            .collect::<Vec<_>>();

        let outcomes = join_all(
            handlers
                .into_iter()
                .map(|descriptor| self.invoke(descriptor, event.clone(), &log)),
        )
        .await;

        let proceed = outcomes.iter().all(|outcome| outcome.proceed);
        let report = DispatchReport {
            dispatch_id,
            event_kind: event.event_kind,
            action_name: event.action_name.clone(),
            session_id: event.session_id.clone(),
            proceed,
            outcomes,
            warnings,
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        log.info(
            "dispatch.completed",
            if proceed { "continue" } else { "blocked" },
            &format!(
                "{} handler(s) in {}ms, blocking: [{}]",
                report.outcomes.len(),
                report.elapsed_ms,
                report.blocking_handlers().join(", ")
            ),
        );
        report
    }

    async fn invoke(
        &self,
        descriptor: HandlerDescriptor,
        event: Arc<HookEvent>,
        dispatch_log: &LogContext,
    ) -> DispatchOutcome {
        let log = dispatch_log.for_handler(&descriptor.name);
        let started = Instant::now();
        log.debug("handler.state", InvocationState::Pending.as_str(), "");

        let handler = match self.registry.factory().build(&descriptor) {
            Ok(handler) => handler,
            Err(err) => {
                let settled = Settled::failed("HANDLER_FAILURE", format!("could not build handler: {err:#}"));
                return self.finish(&descriptor, &log, started, settled);
            }
        };

        let lease = match descriptor.resource_pool.as_deref() {
            Some(pool) => {
                log.pool_event(
                    Level::DEBUG,
                    "handler.state",
                    pool,
                    InvocationState::Acquiring.as_str(),
                    "",
                );
                let wait = self.settings.pool_wait(pool);
                match self.pools.acquire_for(pool, wait, Some(descriptor.timeout())).await {
                    Ok(lease) => Some(lease),
                    Err(err) => {
                        log.pool_event(Level::WARN, "pool.exhausted", pool, "failed", &err.to_string());
                        let settled = Settled::failed(err.code(), err.to_string());
                        return self.finish(&descriptor, &log, started, settled);
                    }
                }
            }
            None => None,
        };

        log.debug("handler.state", InvocationState::Running.as_str(), "");
        let ctx = HookContext::new(log.clone(), self.tools.clone(), descriptor.config.clone());
        let task_event = event.clone();
        let mut task = tokio::spawn(async move { handler.evaluate(&task_event, &ctx).await });

        let budget = descriptor.timeout();
        let settled = match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(Ok(verdict))) => Settled::completed(verdict),
            Ok(Ok(Err(err))) => Settled::failed("HANDLER_FAILURE", format!("{err:#}")),
            Ok(Err(join_err)) if join_err.is_panic() => {
                Settled::failed("HANDLER_FAILURE", "handler panicked")
            }
            Ok(Err(_)) => Settled::failed("HANDLER_FAILURE", "handler task was cancelled"),
            Err(_) => {
                task.abort();
                Settled::timed_out(TollgateError::TimeoutExceeded {
                    budget_ms: budget.as_millis() as u64,
                })
            }
        };

        if let Some(lease) = lease {
            if lease.release_async().await {
                log.pool_event(
                    Level::DEBUG,
                    "handler.state",
                    lease.pool(),
                    InvocationState::Released.as_str(),
                    "",
                );
            }
        }
        self.finish(&descriptor, &log, started, settled)
    }

    fn finish(
        &self,
        descriptor: &HandlerDescriptor,
        log: &LogContext,
        started: Instant,
        settled: Settled,
    ) -> DispatchOutcome {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (proceed, message) = match settled.verdict {
            Some(verdict) => (verdict.proceed, verdict.message),
            None => (descriptor.fail_policy.allows_on_failure(), None),
        };

        match (&settled.error, settled.state) {
            (Some(error), InvocationState::TimedOut) => {
                log.warn("handler.timed_out", settled.error_code, error)
            }
            (Some(error), _) => log.warn("handler.failed", settled.error_code, error),
            (None, _) => log.info(
                "handler.completed",
                if proceed { "continue" } else { "blocked" },
                &format!("{elapsed_ms}ms"),
            ),
        }

        DispatchOutcome {
            handler_name: descriptor.name.clone(),
            proceed,
            message,
            error: settled.error,
            elapsed_ms,
            state: settled.state,
            fail_policy: descriptor.fail_policy,
        }
    }
}
