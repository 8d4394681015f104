//! Locates external tools (project-local, then `PATH`, then a remote
//! endpoint) and memoizes the answer with a TTL, in memory and in a JSON file
//! shared by every dispatch process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tollgate_types::{ToolAvailabilityRecord, ToolLocation};

use crate::config::{DispatchSettings, ToolSettings};
use crate::error::{Result, TollgateError};
use crate::storage_paths::{now_ms, write_json_atomic, StatePaths};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub id: String,
    pub local: Vec<PathBuf>,
    pub global: Vec<String>,
    pub remote: Option<String>,
}

impl ToolSpec {
    /// A tool nobody configured: look for a command of the same name on `PATH`.
    pub fn bare(id: &str) -> Self {
        Self {
            id: id.to_string(),
            local: Vec::new(),
            global: vec![id.to_string()],
            remote: None,
        }
    }

    pub fn from_settings(id: &str, settings: &ToolSettings, project_root: &Path) -> Self {
        Self {
            id: id.to_string(),
            local: settings
                .local
                .iter()
                .map(|rel| project_root.join(rel))
                .collect(),
            global: settings.global.clone(),
            remote: settings.remote.clone(),
        }
    }

    /// Probe order: every local path, every global name, then the remote.
    pub fn candidates(&self) -> Vec<ProbeCandidate> {
        let mut out = self
            .local
            .iter()
            .cloned()
            .map(ProbeCandidate::Local)
            .collect::<Vec<_>>();
        out.extend(self.global.iter().cloned().map(ProbeCandidate::Global));
        out.extend(self.remote.iter().cloned().map(ProbeCandidate::Remote));
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCandidate {
    Local(PathBuf),
    Global(String),
    Remote(String),
}

#[async_trait]
pub trait ToolProbe: Send + Sync {
    async fn probe(&self, candidate: &ProbeCandidate) -> Option<ToolLocation>;
}

/// Filesystem and HTTP checks against the real host.
#[derive(Debug, Clone, Default)]
pub struct SystemProbe {
    client: reqwest::Client,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ToolProbe for SystemProbe {
    async fn probe(&self, candidate: &ProbeCandidate) -> Option<ToolLocation> {
        match candidate {
            ProbeCandidate::Local(path) => path
                .is_file()
                .then(|| ToolLocation::Local(path.clone())),
            ProbeCandidate::Global(name) => find_on_path(name).map(ToolLocation::Global),
            ProbeCandidate::Remote(url) => {
                let response = self.client.get(url).send().await.ok()?;
                (!response.status().is_server_error())
                    .then(|| ToolLocation::Remote(url.clone()))
            }
        }
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{name}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub probe_timeout: Duration,
    pub available_ttl: Duration,
    pub unavailable_ttl: Duration,
    pub cache_path: Option<PathBuf>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            available_ttl: Duration::from_secs(300),
            unavailable_ttl: Duration::from_secs(60),
            cache_path: None,
        }
    }
}

struct AvailabilityCache {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, ToolAvailabilityRecord>>,
}

impl AvailabilityCache {
    fn open(path: Option<PathBuf>) -> Self {
        let entries = path.as_deref().map(read_cache_file).unwrap_or_default();
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    fn fresh(&self, tool: &str) -> Option<ToolAvailabilityRecord> {
        let now = now_ms();
        if let Some(record) = self.read_entries().get(tool).filter(|r| !r.is_expired(now)) {
            return Some(record.clone());
        }
        // Another process may have resolved it since we loaded.
        let path = self.path.as_deref()?;
        let record = read_cache_file(path)
            .remove(tool)
            .filter(|r| !r.is_expired(now))?;
        self.write_entries().insert(tool.to_string(), record.clone());
        Some(record)
    }

    fn store(&self, record: ToolAvailabilityRecord) {
        self.write_entries()
            .insert(record.tool.clone(), record.clone());
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let mut on_disk = read_cache_file(path);
        let now = now_ms();
        on_disk.retain(|_, r| !r.is_expired(now));
        on_disk.insert(record.tool.clone(), record);
        if let Err(err) = write_json_atomic(path, &on_disk) {
            tracing::warn!("failed to persist tool cache {}: {}", path.display(), err);
        }
    }

    fn forget(&self, tool: &str) {
        self.write_entries().remove(tool);
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let mut on_disk = read_cache_file(path);
        if on_disk.remove(tool).is_some() {
            if let Err(err) = write_json_atomic(path, &on_disk) {
                tracing::warn!("failed to persist tool cache {}: {}", path.display(), err);
            }
        }
    }

    fn snapshot(&self) -> Vec<ToolAvailabilityRecord> {
        let mut merged = self
            .path
            .as_deref()
            .map(read_cache_file)
            .unwrap_or_default();
        for (tool, record) in self.read_entries().iter() {
            merged.insert(tool.clone(), record.clone());
        }
        let mut records = merged.into_values().collect::<Vec<_>>();
        records.sort_by(|a, b| a.tool.cmp(&b.tool));
        records
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ToolAvailabilityRecord>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_entries(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ToolAvailabilityRecord>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn read_cache_file(path: &Path) -> HashMap<String, ToolAvailabilityRecord> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    serde_json::from_str(&raw).unwrap_or_else(|err| {
        tracing::warn!("ignoring unreadable tool cache {}: {}", path.display(), err);
        HashMap::new()
    })
}

struct ResolverInner {
    specs: HashMap<String, ToolSpec>,
    probe: Arc<dyn ToolProbe>,
    cache: AvailabilityCache,
    options: ResolverOptions,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

#[derive(Clone)]
pub struct ToolResolver {
    inner: Arc<ResolverInner>,
}

impl ToolResolver {
    pub fn new(
        probe: Arc<dyn ToolProbe>,
        specs: impl IntoIterator<Item = ToolSpec>,
        options: ResolverOptions,
    ) -> Self {
        let specs = specs
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();
        Self {
            inner: Arc::new(ResolverInner {
                specs,
                probe,
                cache: AvailabilityCache::open(options.cache_path.clone()),
                options,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn from_settings(settings: &DispatchSettings, paths: &StatePaths, project_root: &Path) -> Self {
        let specs = settings
            .tools
            .iter()
            .map(|(id, tool)| ToolSpec::from_settings(id, tool, project_root))
            .collect::<Vec<_>>();
        Self::new(
            Arc::new(SystemProbe::new()),
            specs,
            ResolverOptions {
                probe_timeout: settings.probe_timeout(),
                available_ttl: settings.tool_cache_ttl(),
                unavailable_ttl: settings.tool_unavailable_ttl(),
                cache_path: Some(paths.tool_cache_path.clone()),
            },
        )
    }

    pub fn spec(&self, id: &str) -> ToolSpec {
        self.inner
            .specs
            .get(id)
            .cloned()
            .unwrap_or_else(|| ToolSpec::bare(id))
    }

    pub fn known_tools(&self) -> Vec<String> {
        let mut ids = self.inner.specs.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// First usable location of `id`, or `ToolUnavailable`. Answers come from
    /// the cache while fresh; concurrent lookups of one tool probe once.
    pub async fn resolve(&self, id: &str) -> Result<ToolLocation> {
        if let Some(record) = self.inner.cache.fresh(id) {
            return into_location(record);
        }

        let gate = {
            let mut inflight = self.inner.inflight.lock().await;
            inflight
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _single_flight = gate.lock().await;
        if let Some(record) = self.inner.cache.fresh(id) {
            return into_location(record);
        }

        let record = self.probe_all(id).await;
        self.inner.cache.store(record.clone());
        into_location(record)
    }

    /// Drop the cached answer so the next lookup probes again.
    pub fn invalidate(&self, id: &str) {
        self.inner.cache.forget(id);
    }

    /// Every cached record, expired ones included.
    pub fn status_report(&self) -> Vec<ToolAvailabilityRecord> {
        self.inner.cache.snapshot()
    }

    async fn probe_all(&self, id: &str) -> ToolAvailabilityRecord {
        let options = &self.inner.options;
        let mut location = None;
        for candidate in self.spec(id).candidates() {
            match tokio::time::timeout(options.probe_timeout, self.inner.probe.probe(&candidate))
                .await
            {
                Ok(Some(found)) => {
                    location = Some(found);
                    break;
                }
                Ok(None) => {}
                Err(_) => tracing::debug!(
                    "probe of {:?} for tool `{}` exceeded {}ms",
                    candidate,
                    id,
                    options.probe_timeout.as_millis()
                ),
            }
        }
        let ttl = if location.is_some() {
            options.available_ttl
        } else {
            options.unavailable_ttl
        };
        ToolAvailabilityRecord {
            tool: id.to_string(),
            location,
            resolved_at_ms: now_ms(),
            ttl_ms: ttl.as_millis() as u64,
        }
    }
}

fn into_location(record: ToolAvailabilityRecord) -> Result<ToolLocation> {
    record
        .location
        .ok_or(TollgateError::ToolUnavailable(record.tool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingProbe {
        calls: AtomicUsize,
        hit: Option<ProbeCandidate>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl ToolProbe for CountingProbe {
        async fn probe(&self, candidate: &ProbeCandidate) -> Option<ToolLocation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.hit.as_ref() != Some(candidate) {
                return None;
            }
            match candidate {
                ProbeCandidate::Local(path) => Some(ToolLocation::Local(path.clone())),
                ProbeCandidate::Global(name) => Some(ToolLocation::Global(PathBuf::from(name))),
                ProbeCandidate::Remote(url) => Some(ToolLocation::Remote(url.clone())),
            }
        }
    }

    fn eslint() -> ToolSpec {
        ToolSpec {
            id: "eslint".to_string(),
            local: vec![PathBuf::from("/repo/node_modules/.bin/eslint")],
            global: vec!["eslint".to_string()],
            remote: Some("https://lint.example/eslint".to_string()),
        }
    }

    #[tokio::test]
    async fn second_location_hit_is_cached() {
        let probe = Arc::new(CountingProbe {
            hit: Some(ProbeCandidate::Global("eslint".to_string())),
            ..CountingProbe::default()
        });
        let resolver = ToolResolver::new(probe.clone(), [eslint()], ResolverOptions::default());

        let first = resolver.resolve("eslint").await.expect("resolve");
        assert_eq!(first, ToolLocation::Global(PathBuf::from("eslint")));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);

        let second = resolver.resolve("eslint").await.expect("cached");
        assert_eq!(second, first);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn miss_uses_the_shorter_ttl() {
        let probe = Arc::new(CountingProbe::default());
        let options = ResolverOptions {
            available_ttl: Duration::from_secs(300),
            unavailable_ttl: Duration::from_secs(7),
            ..ResolverOptions::default()
        };
        let resolver = ToolResolver::new(probe.clone(), [eslint()], options);

        let err = resolver.resolve("eslint").await.unwrap_err();
        assert!(matches!(err, TollgateError::ToolUnavailable(ref id) if id == "eslint"));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);

        let report = resolver.status_report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].ttl_ms, 7_000);
        assert!(!report[0].is_available());

        assert!(resolver.resolve("eslint").await.is_err());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn expired_records_are_probed_again() {
        let options = ResolverOptions {
            available_ttl: Duration::from_millis(20),
            unavailable_ttl: Duration::from_millis(20),
            ..ResolverOptions::default()
        };

        let missing = Arc::new(CountingProbe::default());
        let resolver = ToolResolver::new(missing.clone(), [eslint()], options.clone());
        assert!(resolver.resolve("eslint").await.is_err());
        assert_eq!(missing.calls.load(Ordering::SeqCst), 3);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(resolver.resolve("eslint").await.is_err());
        assert_eq!(missing.calls.load(Ordering::SeqCst), 6);

        let present = Arc::new(CountingProbe {
            hit: Some(ProbeCandidate::Local(PathBuf::from(
                "/repo/node_modules/.bin/eslint",
            ))),
            ..CountingProbe::default()
        });
        let resolver = ToolResolver::new(present.clone(), [eslint()], options);
        resolver.resolve("eslint").await.expect("first");
        assert_eq!(present.calls.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        resolver.resolve("eslint").await.expect("after expiry");
        assert_eq!(present.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_probe_is_bounded_by_probe_timeout() {
        let probe = Arc::new(CountingProbe {
            delay: Some(Duration::from_secs(10)),
            ..CountingProbe::default()
        });
        let options = ResolverOptions {
            probe_timeout: Duration::from_millis(30),
            ..ResolverOptions::default()
        };
        let resolver = ToolResolver::new(probe, [eslint()], options);

        let started = std::time::Instant::now();
        assert!(resolver.resolve("eslint").await.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unknown_tool_is_searched_by_name() {
        let probe = Arc::new(CountingProbe {
            hit: Some(ProbeCandidate::Global("rg".to_string())),
            ..CountingProbe::default()
        });
        let resolver = ToolResolver::new(probe, Vec::new(), ResolverOptions::default());
        let found = resolver.resolve("rg").await.expect("rg");
        assert_eq!(found.source(), "global");
    }

    #[tokio::test]
    async fn cache_file_is_shared_between_resolvers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = ResolverOptions {
            cache_path: Some(dir.path().join("tool_cache.json")),
            ..ResolverOptions::default()
        };
        let first_probe = Arc::new(CountingProbe {
            hit: Some(ProbeCandidate::Local(PathBuf::from(
                "/repo/node_modules/.bin/eslint",
            ))),
            ..CountingProbe::default()
        });
        let first = ToolResolver::new(first_probe, [eslint()], options.clone());
        first.resolve("eslint").await.expect("first");

        let second_probe = Arc::new(CountingProbe::default());
        let second = ToolResolver::new(second_probe.clone(), [eslint()], options);
        let found = second.resolve("eslint").await.expect("from disk");
        assert_eq!(found.source(), "local");
        assert_eq!(second_probe.calls.load(Ordering::SeqCst), 0);

        second.invalidate("eslint");
        assert!(second.resolve("eslint").await.is_err());
        assert_eq!(second_probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn concurrent_lookups_probe_once() {
        let probe = Arc::new(CountingProbe {
            hit: Some(ProbeCandidate::Local(PathBuf::from(
                "/repo/node_modules/.bin/eslint",
            ))),
            delay: Some(Duration::from_millis(20)),
            ..CountingProbe::default()
        });
        let resolver = ToolResolver::new(probe.clone(), [eslint()], ResolverOptions::default());
        let lookups = (0..4).map(|_| resolver.resolve("eslint"));
        let results = futures::future::join_all(lookups).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }
}
