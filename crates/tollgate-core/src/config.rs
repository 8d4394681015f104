use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use crate::error::{Result, TollgateError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolBackendKind {
    /// Lock files shared by every dispatch process on the host.
    #[default]
    File,
    /// Counters local to one long-lived process.
    Memory,
}

impl PoolBackendKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "file" | "files" | "shared" => Some(PoolBackendKind::File),
            "memory" | "mem" | "inprocess" | "in-process" => Some(PoolBackendKind::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSettings {
    pub max: usize,
    /// Wait budget for this pool; falls back to `pool_wait_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Where to look for an external tool, in probe order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ToolSettings {
    /// Paths relative to the project root, e.g. `node_modules/.bin/eslint`.
    #[serde(default)]
    pub local: Vec<String>,
    /// Command names searched on `PATH`.
    #[serde(default)]
    pub global: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root: Option<PathBuf>,
    pub default_handler_timeout_ms: u64,
    pub default_pool_capacity: usize,
    pub pool_wait_ms: u64,
    pub pool_poll_interval_ms: u64,
    /// Grace past a holder's declared hold before a file-pool slot held by
    /// a live process is reclaimed. Dead holders are reclaimed at once.
    pub stale_lease_secs: u64,
    pub probe_timeout_ms: u64,
    pub tool_cache_ttl_secs: u64,
    pub tool_unavailable_ttl_secs: u64,
    pub pool_backend: PoolBackendKind,
    pub log_retention_days: u64,
    #[serde(default)]
    pub pools: HashMap<String, PoolSettings>,
    #[serde(default)]
    pub tools: HashMap<String, ToolSettings>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        let mut pools = HashMap::new();
        pools.insert(
            "agents".to_string(),
            PoolSettings {
                max: 3,
                wait_ms: None,
                description: "Headless agent subprocesses".to_string(),
            },
        );
        pools.insert(
            "linting".to_string(),
            PoolSettings {
                max: 2,
                wait_ms: None,
                description: "Linter and formatter runs".to_string(),
            },
        );
        pools.insert(
            "testing".to_string(),
            PoolSettings {
                max: 1,
                wait_ms: None,
                description: "Test execution".to_string(),
            },
        );
        Self {
            catalog_path: None,
            state_dir: None,
            project_root: None,
            default_handler_timeout_ms: 30_000,
            default_pool_capacity: 2,
            pool_wait_ms: 10_000,
            pool_poll_interval_ms: 25,
            stale_lease_secs: 300,
            probe_timeout_ms: 5_000,
            tool_cache_ttl_secs: 300,
            tool_unavailable_ttl_secs: 60,
            pool_backend: PoolBackendKind::File,
            log_retention_days: 14,
            pools,
            tools: HashMap::new(),
        }
    }
}

impl DispatchSettings {
    pub fn default_handler_timeout(&self) -> Duration {
        Duration::from_millis(self.default_handler_timeout_ms.max(1))
    }

    pub fn pool_wait(&self, pool: &str) -> Duration {
        let ms = self
            .pools
            .get(pool)
            .and_then(|p| p.wait_ms)
            .unwrap_or(self.pool_wait_ms);
        Duration::from_millis(ms)
    }

    pub fn pool_capacities(&self) -> HashMap<String, usize> {
        self.pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.max))
            .collect()
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    pub fn tool_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.tool_cache_ttl_secs)
    }

    pub fn tool_unavailable_ttl(&self) -> Duration {
        Duration::from_secs(self.tool_unavailable_ttl_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.default_pool_capacity == 0 {
            return Err(TollgateError::Config(
                "default_pool_capacity must be positive".to_string(),
            ));
        }
        if let Some((name, _)) = self.pools.iter().find(|(_, pool)| pool.max == 0) {
            return Err(TollgateError::Config(format!(
                "pool `{name}` must have a positive max"
            )));
        }
        Ok(())
    }
}

/// Settings assembled from layered JSON documents:
/// defaults < global < project < environment < command line.
#[derive(Debug, Clone)]
pub struct SettingsLoader {
    global_path: Option<PathBuf>,
    project_path: PathBuf,
    cli_overrides: Option<Value>,
}

impl SettingsLoader {
    pub fn new(project_root: impl AsRef<Path>, cli_overrides: Option<Value>) -> Self {
        Self {
            global_path: resolve_global_config_path(),
            project_path: project_root.as_ref().join(".tollgate").join("config.json"),
            cli_overrides,
        }
    }

    pub fn with_global_path(mut self, path: Option<PathBuf>) -> Self {
        self.global_path = path;
        self
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub async fn load(&self) -> Result<DispatchSettings> {
        let mut merged = serde_json::to_value(DispatchSettings::default())?;
        if let Some(global_path) = &self.global_path {
            deep_merge(&mut merged, &read_json_file(global_path).await?);
        }
        deep_merge(&mut merged, &read_json_file(&self.project_path).await?);
        deep_merge(&mut merged, &env_layer());
        if let Some(cli) = &self.cli_overrides {
            deep_merge(&mut merged, cli);
        }
        let settings: DispatchSettings = serde_json::from_value(merged)
            .map_err(|err| TollgateError::Config(format!("invalid settings: {err}")))?;
        settings.validate()?;
        Ok(settings)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    serde_json::from_str::<Value>(&raw)
        .map_err(|err| TollgateError::Config(format!("{}: {err}", path.display())))
}

fn resolve_global_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("TOLLGATE_GLOBAL_CONFIG") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir().map(|dir| dir.join("tollgate").join("config.json"))
}

fn env_layer() -> Value {
    let mut root = empty_object();

    for (var, key) in [
        ("TOLLGATE_DEFAULT_TIMEOUT_MS", "default_handler_timeout_ms"),
        ("TOLLGATE_POOL_WAIT_MS", "pool_wait_ms"),
        ("TOLLGATE_PROBE_TIMEOUT_MS", "probe_timeout_ms"),
        ("TOLLGATE_TOOL_CACHE_TTL_SECS", "tool_cache_ttl_secs"),
        ("TOLLGATE_TOOL_UNAVAILABLE_TTL_SECS", "tool_unavailable_ttl_secs"),
        ("TOLLGATE_STALE_LEASE_SECS", "stale_lease_secs"),
    ] {
        if let Some(value) = env_u64(var) {
            deep_merge(&mut root, &json!({ key: value }));
        }
    }
    if let Some(capacity) = env_u64("TOLLGATE_DEFAULT_POOL_CAPACITY") {
        deep_merge(&mut root, &json!({ "default_pool_capacity": capacity }));
    }
    if let Ok(raw) = std::env::var("TOLLGATE_POOL_BACKEND") {
        if let Some(kind) = PoolBackendKind::parse(&raw) {
            deep_merge(&mut root, &json!({ "pool_backend": kind }));
        } else {
            tracing::warn!("ignoring unknown TOLLGATE_POOL_BACKEND value `{}`", raw);
        }
    }
    for (var, key) in [
        ("TOLLGATE_STATE_DIR", "state_dir"),
        ("TOLLGATE_CATALOG", "catalog_path"),
        ("TOLLGATE_PROJECT_ROOT", "project_root"),
    ] {
        if let Ok(raw) = std::env::var(var) {
            if !raw.trim().is_empty() {
                deep_merge(&mut root, &json!({ key: raw.trim() }));
            }
        }
    }

    root
}

fn env_u64(var: &str) -> Option<u64> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("ignoring non-numeric {}=`{}`", var, raw);
            None
        }
    }
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
