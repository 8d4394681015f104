use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tollgate_observability::canonical_logs_dir_from_root;
use uuid::Uuid;

/// On-disk layout shared by every dispatch process on the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
    pub lock_dir: PathBuf,
    pub tool_cache_path: PathBuf,
    pub logs_dir: PathBuf,
}

impl StatePaths {
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            lock_dir: root.join("pools"),
            tool_cache_path: root.join("tool_cache.json"),
            logs_dir: canonical_logs_dir_from_root(&root),
            root,
        }
    }

    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.lock_dir)?;
        fs::create_dir_all(&self.logs_dir)?;
        Ok(())
    }
}

/// Resolve the state root: explicit flag, then `TOLLGATE_STATE_DIR`, then the
/// platform data dir, then `.tollgate` in the working directory.
pub fn resolve_state_paths(explicit: Option<&Path>) -> StatePaths {
    if let Some(path) = explicit {
        return StatePaths::from_root(path);
    }
    if let Ok(raw) = std::env::var("TOLLGATE_STATE_DIR") {
        if !raw.trim().is_empty() {
            return StatePaths::from_root(raw.trim());
        }
    }
    match dirs::data_dir() {
        Some(base) => StatePaths::from_root(base.join("tollgate")),
        None => StatePaths::from_root(".tollgate"),
    }
}

/// Write JSON through a sibling temp file and rename, so readers in other
/// processes never see a torn document. Each call gets its own temp file;
/// concurrent writers race only on the rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    let suffix = format!("tmp.{}.{}", std::process::id(), Uuid::new_v4().simple());
    let tmp = path.with_extension(suffix);
    fs::write(&tmp, format!("{}\n", text))?;
    fs::rename(&tmp, path)
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
