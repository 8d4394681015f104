use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::{fs, io::Read};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tollgate_core::{
    now_ms, resolve_state_paths, Dispatcher, DispatchSettings, HandlerFactory, PoolBackendKind,
    SettingsLoader, StatePaths,
};
use tollgate_observability::{
    emit_event, init_process_logging, ObservabilityEvent, ProcessKind, WorkerGuard,
};
use tollgate_types::{DispatchReport, EventKind, HookEvent};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(about = "Runs agent lifecycle hooks concurrently under shared resource limits")]
struct Cli {
    #[command(flatten)]
    globals: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct GlobalArgs {
    /// Project whose `.tollgate/` holds the catalog and project settings.
    #[arg(long, global = true, env = "TOLLGATE_PROJECT_ROOT")]
    project_dir: Option<String>,
    #[arg(long, global = true)]
    state_dir: Option<String>,
    #[arg(long, global = true)]
    catalog: Option<String>,
    /// `file` (shared across processes) or `memory`.
    #[arg(long, global = true)]
    pool_backend: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Dispatch one event (JSON inline, `@file`, or `-` for stdin).
    Dispatch {
        #[arg(long, default_value = "-")]
        event: String,
        /// Include per-handler outcomes in the response.
        #[arg(long, default_value_t = false)]
        report: bool,
        /// Read NDJSON events from stdin until EOF, one response line each.
        #[arg(long, default_value_t = false)]
        stream: bool,
    },
    /// Show occupancy of the configured resource pools.
    Pools {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Tools {
        #[command(subcommand)]
        command: ToolsCommand,
    },
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ToolsCommand {
    /// Cached availability of every tool resolved so far.
    Status,
    Resolve {
        id: String,
        /// Drop the cached answer and probe again.
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },
}

#[derive(Subcommand, Debug)]
enum CatalogCommand {
    List {
        #[arg(long)]
        kind: Option<String>,
    },
    /// Parse the catalog and construct every enabled handler.
    Validate,
}

struct Runtime {
    settings: DispatchSettings,
    paths: StatePaths,
    dispatcher: Dispatcher,
    _log_guard: Option<WorkerGuard>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("tollgate: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    match cli.command {
        Command::Dispatch {
            event,
            report,
            stream,
        } => {
            if stream {
                run_stream(&cli.globals).await
            } else {
                Ok(run_single(&cli.globals, &event, report).await)
            }
        }
        Command::Pools { json } => {
            let runtime = Runtime::load(&cli.globals, ProcessKind::Cli).await?;
            let pools = runtime.dispatcher.pools();
            let mut statuses = Vec::new();
            for name in pools.configured_pools() {
                statuses.push(pools.status(&name).await?);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                println!("backend: {:?}", pools.backend_kind());
                for status in statuses {
                    println!(
                        "{:<12} {}/{} in use, {} waiting",
                        status.pool, status.in_use, status.capacity, status.waiting
                    );
                }
            }
            Ok(0)
        }
        Command::Tools { command } => {
            let runtime = Runtime::load(&cli.globals, ProcessKind::Cli).await?;
            let tools = runtime.dispatcher.tools();
            match command {
                ToolsCommand::Status => {
                    let now = now_ms();
                    let records = tools.status_report();
                    if records.is_empty() {
                        println!("no tools resolved yet");
                    }
                    for record in records {
                        let remaining_secs =
                            (record.resolved_at_ms + record.ttl_ms).saturating_sub(now) / 1000;
                        match &record.location {
                            Some(location) => println!(
                                "{:<16} available ({}) {}, fresh for {}s",
                                record.tool,
                                location.source(),
                                location.display(),
                                remaining_secs
                            ),
                            None => println!(
                                "{:<16} unavailable, retry in {}s",
                                record.tool, remaining_secs
                            ),
                        }
                    }
                    Ok(0)
                }
                ToolsCommand::Resolve { id, refresh } => {
                    if refresh {
                        tools.invalidate(&id);
                    }
                    match tools.resolve(&id).await {
                        Ok(location) => {
                            println!("{}", serde_json::to_string_pretty(&location)?);
                            Ok(0)
                        }
                        Err(err) => {
                            eprintln!("{err}");
                            Ok(1)
                        }
                    }
                }
            }
        }
        Command::Catalog { command } => {
            let runtime = Runtime::load(&cli.globals, ProcessKind::Cli).await?;
            let registry = runtime.dispatcher.registry();
            match command {
                CatalogCommand::List { kind } => {
                    let kind = kind
                        .map(|raw| {
                            EventKind::parse(&raw)
                                .with_context(|| format!("unknown event kind `{raw}`"))
                        })
                        .transpose()?;
                    let selection = registry.load_all().await?;
                    let handlers = selection
                        .handlers
                        .into_iter()
                        .filter(|d| kind.map(|k| d.applies_to(k)).unwrap_or(true))
                        .collect::<Vec<_>>();
                    println!("{}", serde_json::to_string_pretty(&handlers)?);
                    for warning in selection.warnings {
                        eprintln!("warning: {warning}");
                    }
                    Ok(0)
                }
                CatalogCommand::Validate => {
                    let Some(path) = registry.catalog_path() else {
                        anyhow::bail!("no catalog configured");
                    };
                    let selection = registry.load_all().await?;
                    let mut problems = selection.warnings.clone();
                    for descriptor in selection.handlers.iter().filter(|d| d.enabled) {
                        if let Err(err) = registry.factory().build(descriptor) {
                            problems.push(format!("hook `{}`: {err:#}", descriptor.name));
                        }
                    }
                    if problems.is_empty() {
                        println!(
                            "{}: {} hook(s) ok",
                            path.display(),
                            selection.handlers.len()
                        );
                        Ok(0)
                    } else {
                        for problem in &problems {
                            eprintln!("{problem}");
                        }
                        Ok(1)
                    }
                }
            }
        }
    }
}

impl Runtime {
    async fn load(globals: &GlobalArgs, process: ProcessKind) -> anyhow::Result<Self> {
        let project_root = match &globals.project_dir {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().context("cannot determine working directory")?,
        };
        let overrides = build_cli_overrides(globals, process == ProcessKind::Stream)?;
        let mut settings = SettingsLoader::new(&project_root, overrides)
            .load()
            .await
            .context("failed to load settings")?;
        settings.catalog_path = Some(resolve_catalog_path(&settings, &project_root));
        settings.project_root = Some(project_root.clone());

        let paths = resolve_state_paths(settings.state_dir.as_deref());
        paths
            .ensure()
            .with_context(|| format!("cannot create state dir {}", paths.root.display()))?;

        let log_guard = match init_process_logging(process, &paths.logs_dir, settings.log_retention_days) {
            Ok((guard, log_info)) => {
                emit_event(
                    tracing::Level::INFO,
                    process,
                    ObservabilityEvent {
                        event: "logging.initialized",
                        component: "tollgate.main",
                        status: Some("ok"),
                        detail: Some("jsonl logging initialized"),
                        ..ObservabilityEvent::default()
                    },
                );
                info!("tollgate logging initialized: {:?}", log_info);
                Some(guard)
            }
            Err(err) => {
                eprintln!("tollgate: file logging disabled: {err:#}");
                None
            }
        };
        info!(
            "state_dir={} catalog={} pool_backend={:?}",
            paths.root.display(),
            settings
                .catalog_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            settings.pool_backend
        );

        let dispatcher = Dispatcher::from_settings(
            settings.clone(),
            &paths,
            &project_root,
            HandlerFactory::with_builtins(),
        )
        .with_process(process);

        Ok(Self {
            settings,
            paths,
            dispatcher,
            _log_guard: log_guard,
        })
    }
}

/// Single-event mode. Never fails: anything that goes wrong before the
/// handlers run degrades to "allow" with a warning.
async fn run_single(globals: &GlobalArgs, input: &str, with_report: bool) -> u8 {
    let event = match read_event_json(input).and_then(|raw| parse_event(&raw)) {
        Ok(event) => event,
        Err(err) => {
            print_degraded(&format!("invalid event: {err:#}"));
            return 0;
        }
    };
    let runtime = match Runtime::load(globals, ProcessKind::Dispatch).await {
        Ok(runtime) => runtime,
        Err(err) => {
            print_degraded(&format!("dispatcher unavailable: {err:#}"));
            return 0;
        }
    };
    tracing::debug!(
        "dispatching with state at {} (default timeout {}ms)",
        runtime.paths.root.display(),
        runtime.settings.default_handler_timeout_ms
    );

    let report = runtime.dispatcher.dispatch(event).await;
    println!("{}", render_response(&report, with_report));
    if !report.proceed {
        eprintln!("{}", report.diagnostics());
    }
    report.exit_code() as u8
}

/// Stream mode: one long-lived process, events dispatched concurrently,
/// responses written in input order.
async fn run_stream(globals: &GlobalArgs) -> anyhow::Result<u8> {
    let runtime = Runtime::load(globals, ProcessKind::Stream).await?;
    let (tx, mut rx) = mpsc::channel::<tokio::task::JoinHandle<Value>>(64);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(pending) = rx.recv().await {
            let line = match pending.await {
                Ok(value) => value,
                Err(err) => degraded_response(&format!("dispatch aborted: {err}")),
            };
            stdout.write_all(format!("{line}\n").as_bytes()).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let dispatcher = runtime.dispatcher.clone();
        let handle = tokio::spawn(async move {
            match parse_event(&line) {
                Ok(event) => {
                    let report = dispatcher.dispatch(event).await;
                    let mut response = render_response(&report, true);
                    response["dispatchId"] = json!(report.dispatch_id);
                    response["sessionId"] = json!(report.session_id);
                    response
                }
                Err(err) => degraded_response(&format!("invalid event: {err:#}")),
            }
        });
        if tx.send(handle).await.is_err() {
            break;
        }
    }
    drop(tx);
    writer.await??;
    Ok(0)
}

fn build_cli_overrides(globals: &GlobalArgs, prefer_memory: bool) -> anyhow::Result<Option<Value>> {
    let mut root = serde_json::Map::new();
    if let Some(dir) = &globals.state_dir {
        root.insert("state_dir".to_string(), Value::String(dir.clone()));
    }
    if let Some(catalog) = &globals.catalog {
        root.insert("catalog_path".to_string(), Value::String(catalog.clone()));
    }
    let backend = match globals.pool_backend.as_deref() {
        Some(raw) => Some(
            PoolBackendKind::parse(raw)
                .with_context(|| format!("unknown pool backend `{raw}` (expected file or memory)"))?,
        ),
        None if prefer_memory => Some(PoolBackendKind::Memory),
        None => None,
    };
    if let Some(backend) = backend {
        root.insert("pool_backend".to_string(), serde_json::to_value(backend)?);
    }
    if root.is_empty() {
        return Ok(None);
    }
    Ok(Some(Value::Object(root)))
}

/// Explicit catalog (relative to the project), else the first of
/// `.tollgate/hooks.{json,yaml,yml}` that exists.
fn resolve_catalog_path(settings: &DispatchSettings, project_root: &Path) -> PathBuf {
    if let Some(path) = &settings.catalog_path {
        return if path.is_absolute() {
            path.clone()
        } else {
            project_root.join(path)
        };
    }
    let dir = project_root.join(".tollgate");
    ["hooks.json", "hooks.yaml", "hooks.yml"]
        .iter()
        .map(|name| dir.join(name))
        .find(|candidate| candidate.exists())
        .unwrap_or_else(|| dir.join("hooks.json"))
}

fn read_event_json(input: &str) -> anyhow::Result<String> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    if let Some(path) = input.strip_prefix('@') {
        return fs::read_to_string(path).with_context(|| format!("cannot read {path}"));
    }
    Ok(input.to_string())
}

fn parse_event(raw: &str) -> anyhow::Result<HookEvent> {
    serde_json::from_str(raw.trim()).context("event is not a valid hook payload")
}

fn render_response(report: &DispatchReport, with_report: bool) -> Value {
    let mut response = json!({
        "continue": report.proceed,
        "reasoning": report.diagnostics(),
    });
    if with_report {
        response["report"] = serde_json::to_value(&report.outcomes).unwrap_or(Value::Null);
    }
    response
}

fn degraded_response(warning: &str) -> Value {
    json!({
        "continue": true,
        "reasoning": format!("[tollgate] {warning}"),
    })
}

fn print_degraded(warning: &str) {
    eprintln!("tollgate: {warning}");
    println!("{}", degraded_response(warning));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_types::{DispatchOutcome, FailPolicy, InvocationState};

    fn sample_report(proceed: bool) -> DispatchReport {
        DispatchReport {
            dispatch_id: "d-1".to_string(),
            event_kind: EventKind::PreAction,
            action_name: "Write".to_string(),
            session_id: "ses".to_string(),
            proceed,
            outcomes: vec![DispatchOutcome {
                handler_name: "gate".to_string(),
                proceed,
                message: (!proceed).then(|| "write a failing test first".to_string()),
                error: None,
                elapsed_ms: 4,
                state: InvocationState::Completed,
                fail_policy: FailPolicy::Closed,
            }],
            warnings: Vec::new(),
            started_at: chrono::Utc::now(),
            elapsed_ms: 5,
        }
    }

    #[test]
    fn cli_overrides_are_empty_without_flags() {
        let overrides = build_cli_overrides(&GlobalArgs::default(), false).expect("overrides");
        assert!(overrides.is_none());
    }

    #[test]
    fn stream_mode_prefers_memory_pools_unless_told_otherwise() {
        let memory = build_cli_overrides(&GlobalArgs::default(), true)
            .expect("overrides")
            .expect("some");
        assert_eq!(memory["pool_backend"], "memory");

        let globals = GlobalArgs {
            pool_backend: Some("file".to_string()),
            ..GlobalArgs::default()
        };
        let file = build_cli_overrides(&globals, true)
            .expect("overrides")
            .expect("some");
        assert_eq!(file["pool_backend"], "file");
    }

    #[test]
    fn unknown_pool_backend_is_rejected() {
        let globals = GlobalArgs {
            pool_backend: Some("redis".to_string()),
            ..GlobalArgs::default()
        };
        assert!(build_cli_overrides(&globals, false).is_err());
    }

    #[test]
    fn response_carries_continue_reasoning_and_optional_report() {
        let blocked = sample_report(false);
        let plain = render_response(&blocked, false);
        assert_eq!(plain["continue"], false);
        assert_eq!(plain["reasoning"], "[gate] write a failing test first");
        assert!(plain.get("report").is_none());

        let detailed = render_response(&blocked, true);
        assert_eq!(detailed["report"][0]["handlerName"], "gate");
        assert_eq!(detailed["report"][0]["state"], "completed");
        assert_eq!(blocked.exit_code(), 2);
    }

    #[test]
    fn parses_runtime_payload_from_inline_json() {
        let raw = read_event_json(
            r#"{"hook_event_name": "PreToolUse", "tool_name": "Bash", "tool_input": {"command": "ls"}, "session_id": "s"}"#,
        )
        .expect("raw");
        let event = parse_event(&raw).expect("event");
        assert_eq!(event.action_name, "Bash");
        assert!(parse_event("{\"tool_name\": 3}").is_err());
    }

    #[test]
    fn catalog_path_prefers_existing_yaml_when_json_is_absent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().to_path_buf();
        let tollgate_dir = dir.join(".tollgate");
        fs::create_dir_all(&tollgate_dir).expect("mkdir");
        fs::write(tollgate_dir.join("hooks.yaml"), "hooks: {}\n").expect("write");

        let settings = DispatchSettings::default();
        assert_eq!(
            resolve_catalog_path(&settings, &dir),
            tollgate_dir.join("hooks.yaml")
        );

        let explicit = DispatchSettings {
            catalog_path: Some(PathBuf::from("ci/hooks.json")),
            ..DispatchSettings::default()
        };
        assert_eq!(resolve_catalog_path(&explicit, &dir), dir.join("ci/hooks.json"));
    }
}
