use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tollgate_types::{EventKind, FailPolicy};

use crate::config::deep_merge;
use crate::error::{Result, TollgateError};
use crate::handlers::{ActionPolicyHook, CommandHook};
use crate::hooks::HookHandler;
use crate::matching::matches_any;

/// One catalog entry after per-handler configuration has been applied.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HandlerDescriptor {
    pub name: String,
    /// Factory key of the implementation.
    pub handler_kind: String,
    pub event_kinds: Vec<EventKind>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,
    pub timeout_ms: u64,
    pub fail_policy: FailPolicy,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub config: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl HandlerDescriptor {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn applies_to(&self, kind: EventKind) -> bool {
        self.event_kinds.contains(&kind)
    }

    /// Empty `actions` means every action.
    pub fn matches_action(&self, action: &str) -> bool {
        matches_any(&self.actions, action)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CatalogEntry {
    event_kinds: Vec<EventKind>,
    #[serde(default = "default_enabled")]
    enabled_by_default: bool,
    #[serde(default)]
    resource_pool: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    fail_policy: FailPolicy,
    #[serde(default)]
    config_ref: Option<String>,
    #[serde(default)]
    handler: Option<String>,
    #[serde(default)]
    actions: Vec<String>,
    #[serde(default)]
    description: String,
    /// Inline handler config; a `configRef` document is merged over it.
    #[serde(default)]
    config: Value,
}

fn default_enabled() -> bool {
    true
}

pub type HandlerConstructor =
    Arc<dyn Fn(&HandlerDescriptor) -> anyhow::Result<Arc<dyn HookHandler>> + Send + Sync>;

/// Maps catalog `handler` keys to constructors.
#[derive(Clone, Default)]
pub struct HandlerFactory {
    constructors: HashMap<String, HandlerConstructor>,
}

impl HandlerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register("command", |descriptor| {
            Ok(Arc::new(CommandHook::from_descriptor(descriptor)?) as Arc<dyn HookHandler>)
        });
        factory.register("action_policy", |descriptor| {
            Ok(Arc::new(ActionPolicyHook::from_descriptor(descriptor)?) as Arc<dyn HookHandler>)
        });
        factory
    }

    pub fn register<F>(&mut self, key: impl Into<String>, constructor: F)
    where
        F: Fn(&HandlerDescriptor) -> anyhow::Result<Arc<dyn HookHandler>> + Send + Sync + 'static,
    {
        self.constructors.insert(key.into(), Arc::new(constructor));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.constructors.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = self.constructors.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    pub fn build(&self, descriptor: &HandlerDescriptor) -> anyhow::Result<Arc<dyn HookHandler>> {
        let constructor = self
            .constructors
            .get(&descriptor.handler_kind)
            .ok_or_else(|| anyhow::anyhow!("no handler registered as `{}`", descriptor.handler_kind))?;
        constructor(descriptor)
    }
}

/// Handlers selected for one dispatch plus anything worth telling the user.
#[derive(Debug, Clone, Default)]
pub struct RegistrySelection {
    pub handlers: Vec<HandlerDescriptor>,
    pub warnings: Vec<String>,
}

/// Reads the catalog fresh on every call so edits apply to the next event.
#[derive(Clone)]
pub struct RegistryLoader {
    catalog_path: Option<PathBuf>,
    default_timeout: Duration,
    factory: HandlerFactory,
}

impl RegistryLoader {
    pub fn new(catalog_path: Option<PathBuf>, default_timeout: Duration, factory: HandlerFactory) -> Self {
        Self {
            catalog_path,
            default_timeout,
            factory,
        }
    }

    pub fn catalog_path(&self) -> Option<&Path> {
        self.catalog_path.as_deref()
    }

    pub fn factory(&self) -> &HandlerFactory {
        &self.factory
    }

    /// Enabled handlers for `kind`, in catalog order.
    pub async fn active_handlers(&self, kind: EventKind) -> Result<RegistrySelection> {
        let mut selection = self.load_all().await?;
        selection
            .handlers
            .retain(|descriptor| descriptor.enabled && descriptor.applies_to(kind));
        Ok(selection)
    }

    /// Every catalog entry with its effective enabled flag, in catalog order.
    pub async fn load_all(&self) -> Result<RegistrySelection> {
        let Some(path) = self.catalog_path.as_deref() else {
            return Ok(RegistrySelection::default());
        };
        if !path.exists() {
            tracing::debug!("no handler catalog at {}", path.display());
            return Ok(RegistrySelection::default());
        }
        let raw = fs::read_to_string(path).await?;
        let entries = parse_catalog(&raw, path)?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        let mut selection = RegistrySelection::default();
        for (name, entry) in entries {
            match self.describe(&name, entry, &base_dir).await {
                Ok(descriptor) => selection.handlers.push(descriptor),
                Err(DescribeError::Fatal(err)) => return Err(err),
                Err(DescribeError::Skip(warning)) => {
                    tracing::warn!("{}", warning);
                    selection.warnings.push(warning);
                }
            }
        }
        Ok(selection)
    }

    async fn describe(
        &self,
        name: &str,
        entry: CatalogEntry,
        base_dir: &Path,
    ) -> std::result::Result<HandlerDescriptor, DescribeError> {
        if entry.event_kinds.is_empty() {
            return Err(DescribeError::Fatal(TollgateError::Config(format!(
                "hook `{name}` declares no eventKinds"
            ))));
        }
        if entry.timeout_ms == Some(0) {
            return Err(DescribeError::Fatal(TollgateError::Config(format!(
                "hook `{name}` has a zero timeoutMs"
            ))));
        }
        let handler_kind = entry.handler.clone().unwrap_or_else(|| name.to_string());
        if !self.factory.contains(&handler_kind) {
            return Err(DescribeError::Fatal(TollgateError::Config(format!(
                "hook `{name}` uses unknown handler `{handler_kind}`"
            ))));
        }

        let mut enabled = entry.enabled_by_default;
        let mut config = entry.config;
        if let Some(config_ref) = entry.config_ref.as_deref() {
            let config_path = base_dir.join(config_ref);
            match read_handler_config(&config_path).await {
                Ok(Some(doc)) => {
                    if let Some(flag) = doc.get("enabled").and_then(Value::as_bool) {
                        enabled = flag;
                    }
                    if config.is_null() {
                        config = doc;
                    } else {
                        deep_merge(&mut config, &doc);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(DescribeError::Skip(format!(
                        "skipping hook `{name}`: unreadable config {}: {err}",
                        config_path.display()
                    )));
                }
            }
        }

        Ok(HandlerDescriptor {
            name: name.to_string(),
            handler_kind,
            event_kinds: entry.event_kinds,
            enabled,
            resource_pool: entry
                .resource_pool
                .map(|pool| pool.trim().to_string())
                .filter(|pool| !pool.is_empty()),
            timeout_ms: entry
                .timeout_ms
                .unwrap_or(self.default_timeout.as_millis() as u64),
            fail_policy: entry.fail_policy,
            config,
            actions: entry.actions,
            description: entry.description,
        })
    }
}

enum DescribeError {
    Fatal(TollgateError),
    Skip(String),
}

fn parse_catalog(raw: &str, path: &Path) -> Result<Vec<(String, CatalogEntry)>> {
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );
    let root: Value = if is_yaml {
        serde_yaml::from_str(raw)
            .map_err(|err| TollgateError::Config(format!("{}: {err}", path.display())))?
    } else {
        serde_json::from_str(raw)
            .map_err(|err| TollgateError::Config(format!("{}: {err}", path.display())))?
    };

    let hooks = match root.get("hooks") {
        Some(hooks) => hooks,
        None => &root,
    };
    let Some(map) = hooks.as_object() else {
        return Err(TollgateError::Config(format!(
            "{}: catalog must be a mapping of hook names",
            path.display()
        )));
    };

    map.iter()
        .map(|(name, raw_entry)| {
            serde_json::from_value::<CatalogEntry>(raw_entry.clone())
                .map(|entry| (name.clone(), entry))
                .map_err(|err| TollgateError::Config(format!("hook `{name}`: {err}")))
        })
        .collect()
}

async fn read_handler_config(path: &Path) -> anyhow::Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).await?;
    let doc: Value = serde_json::from_str(&raw)?;
    if !doc.is_object() {
        anyhow::bail!("expected a JSON object");
    }
    Ok(Some(doc))
}
