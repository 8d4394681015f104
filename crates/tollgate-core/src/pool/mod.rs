//! Named counting semaphores that cap how many handlers of a kind run at
//! once. Two backends: [`FilePoolBackend`] coordinates every dispatch process
//! on the host through lock files, [`MemoryPoolBackend`] serves a single
//! long-lived process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::{DispatchSettings, PoolBackendKind};
use crate::error::{Result, TollgateError};
use crate::storage_paths::StatePaths;

mod file;
mod memory;

pub use file::FilePoolBackend;
pub use memory::MemoryPoolBackend;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub pool: String,
    pub capacity: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub holders: Vec<String>,
}

impl PoolStatus {
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_use)
    }
}

#[async_trait]
pub trait PoolBackend: Send + Sync {
    fn kind(&self) -> PoolBackendKind;

    /// Take one slot of `pool` for `holder`, waiting at most `wait`.
    /// Waiters are admitted in arrival order. `capacity` only applies the
    /// first time the pool is seen; the stored capacity wins afterwards.
    /// `hold` is how long the holder expects to keep the slot, if bounded.
    async fn acquire(
        &self,
        pool: &str,
        capacity: usize,
        holder: &str,
        wait: Duration,
        hold: Option<Duration>,
    ) -> Result<bool>;

    /// Give back the slot held by `holder`. Returns `false` when the holder
    /// had no slot (already released or recovered as stale).
    fn release(&self, pool: &str, holder: &str) -> Result<bool>;

    async fn status(&self, pool: &str, capacity: usize) -> Result<PoolStatus>;
}

/// A held pool slot. Released exactly once, either explicitly or on drop.
pub struct ResourceLease {
    pool: String,
    holder_id: String,
    acquired_at: DateTime<Utc>,
    released: AtomicBool,
    backend: Arc<dyn PoolBackend>,
}

impl std::fmt::Debug for ResourceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLease")
            .field("pool", &self.pool)
            .field("holder_id", &self.holder_id)
            .field("acquired_at", &self.acquired_at)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

impl ResourceLease {
    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Returns `true` only for the call that actually gave the slot back.
    /// Blocks on the backend; async callers use [`ResourceLease::release_async`].
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        let outcome = self.backend.release(&self.pool, &self.holder_id);
        self.settle(outcome)
    }

    /// Same as [`ResourceLease::release`], with the backend work moved off
    /// the async worker thread.
    pub async fn release_async(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        let backend = self.backend.clone();
        let pool = self.pool.clone();
        let holder_id = self.holder_id.clone();
        let outcome = match tokio::task::spawn_blocking(move || backend.release(&pool, &holder_id)).await {
            Ok(outcome) => outcome,
            Err(err) => Err(TollgateError::Io(std::io::Error::other(err))),
        };
        self.settle(outcome)
    }

    fn settle(&self, outcome: Result<bool>) -> bool {
        match outcome {
            Ok(released) => released,
            Err(err) => {
                tracing::warn!(
                    "failed to release pool `{}` slot {}: {}",
                    self.pool,
                    self.holder_id,
                    err
                );
                false
            }
        }
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Clone)]
pub struct ResourcePoolManager {
    backend: Arc<dyn PoolBackend>,
    configured: Arc<HashMap<String, usize>>,
    default_capacity: usize,
    capacities: Arc<Mutex<HashMap<String, usize>>>,
}

impl ResourcePoolManager {
    pub fn new(
        backend: Arc<dyn PoolBackend>,
        configured: HashMap<String, usize>,
        default_capacity: usize,
    ) -> Self {
        Self {
            backend,
            configured: Arc::new(configured),
            default_capacity: default_capacity.max(1),
            capacities: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_settings(settings: &DispatchSettings, paths: &StatePaths) -> Self {
        let backend: Arc<dyn PoolBackend> = match settings.pool_backend {
            PoolBackendKind::File => Arc::new(FilePoolBackend::new(
                paths.lock_dir.clone(),
                Duration::from_millis(settings.pool_poll_interval_ms.max(1)),
                Duration::from_secs(settings.stale_lease_secs),
            )),
            PoolBackendKind::Memory => Arc::new(MemoryPoolBackend::new()),
        };
        Self::new(
            backend,
            settings.pool_capacities(),
            settings.default_pool_capacity,
        )
    }

    pub fn backend_kind(&self) -> PoolBackendKind {
        self.backend.kind()
    }

    /// Capacity of `pool`, fixed the first time this manager sees the name.
    pub fn capacity(&self, pool: &str) -> usize {
        let mut capacities = match self.capacities.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *capacities.entry(pool.to_string()).or_insert_with(|| {
            self.configured
                .get(pool)
                .copied()
                .unwrap_or(self.default_capacity)
                .max(1)
        })
    }

    pub fn configured_pools(&self) -> Vec<String> {
        let mut names = self.configured.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Acquire with no bound on how long the slot is kept.
    pub async fn acquire(&self, pool: &str, wait: Duration) -> Result<ResourceLease> {
        self.acquire_for(pool, wait, None).await
    }

    /// Acquire a slot that will be held for at most `hold`. File-backed
    /// pools use it to reclaim slots whose holder overstays it.
    pub async fn acquire_for(
        &self,
        pool: &str,
        wait: Duration,
        hold: Option<Duration>,
    ) -> Result<ResourceLease> {
        let capacity = self.capacity(pool);
        let holder_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let admitted = self
            .backend
            .acquire(pool, capacity, &holder_id, wait, hold)
            .await?;
        if !admitted {
            return Err(TollgateError::ResourceExhausted {
                pool: pool.to_string(),
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }
        Ok(ResourceLease {
            pool: pool.to_string(),
            holder_id,
            acquired_at: Utc::now(),
            released: AtomicBool::new(false),
            backend: self.backend.clone(),
        })
    }

    pub fn release(&self, lease: &ResourceLease) -> bool {
        lease.release()
    }

    pub async fn status(&self, pool: &str) -> Result<PoolStatus> {
        let capacity = self.capacity(pool);
        self.backend.status(pool, capacity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_manager(capacity: usize) -> ResourcePoolManager {
        let mut configured = HashMap::new();
        configured.insert("linting".to_string(), capacity);
        ResourcePoolManager::new(Arc::new(MemoryPoolBackend::new()), configured, 2)
    }

    #[tokio::test]
    async fn third_acquire_is_exhausted_until_a_release() {
        let pools = memory_manager(2);
        let wait = Duration::from_millis(200);
        let first = pools.acquire("linting", wait).await.expect("first");
        let _second = pools.acquire("linting", wait).await.expect("second");

        let started = Instant::now();
        let err = pools.acquire("linting", wait).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(250));
        match err {
            TollgateError::ResourceExhausted { pool, waited_ms } => {
                assert_eq!(pool, "linting");
                assert!(waited_ms >= 150);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(pools.release(&first));
        let third = pools.acquire("linting", wait).await.expect("third");
        assert_eq!(third.pool(), "linting");
    }

    #[tokio::test]
    async fn release_is_idempotent_and_drop_does_not_double_release() {
        let pools = memory_manager(1);
        let lease = pools
            .acquire("linting", Duration::from_millis(10))
            .await
            .expect("lease");
        assert!(lease.release());
        assert!(!lease.release());
        assert!(lease.is_released());
        drop(lease);

        let status = pools.status("linting").await.expect("status");
        assert_eq!(status.in_use, 0);
        assert_eq!(status.available(), 1);
    }

    #[tokio::test]
    async fn dropping_a_lease_frees_the_slot() {
        let pools = memory_manager(1);
        {
            let _lease = pools
                .acquire("linting", Duration::from_millis(10))
                .await
                .expect("lease");
            assert_eq!(pools.status("linting").await.expect("status").in_use, 1);
        }
        assert_eq!(pools.status("linting").await.expect("status").in_use, 0);
    }

    #[tokio::test]
    async fn async_release_frees_a_file_slot_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend: Arc<dyn PoolBackend> = Arc::new(FilePoolBackend::new(
            dir.path().to_path_buf(),
            Duration::from_millis(5),
            Duration::from_secs(300),
        ));
        let mut configured = HashMap::new();
        configured.insert("testing".to_string(), 1);
        let pools = ResourcePoolManager::new(backend, configured, 1);

        let lease = pools
            .acquire_for("testing", Duration::ZERO, Some(Duration::from_secs(60)))
            .await
            .expect("lease");
        assert_eq!(pools.status("testing").await.expect("status").in_use, 1);
        assert!(lease.release_async().await);
        assert!(!lease.release_async().await);
        assert!(!lease.release());
        drop(lease);

        let status = pools.status("testing").await.expect("status");
        assert_eq!(status.in_use, 0);
        assert_eq!(status.waiting, 0);
    }

    #[tokio::test]
    async fn unknown_pool_uses_default_capacity_and_stays_fixed() {
        let pools = memory_manager(1);
        assert_eq!(pools.capacity("docs"), 2);
        let _a = pools.acquire("docs", Duration::ZERO).await.expect("a");
        let _b = pools.acquire("docs", Duration::ZERO).await.expect("b");
        assert!(pools.acquire("docs", Duration::ZERO).await.is_err());
        assert_eq!(pools.capacity("docs"), 2);
    }

    #[tokio::test]
    async fn waiter_is_admitted_when_a_holder_releases() {
        let pools = memory_manager(1);
        let held = pools
            .acquire("linting", Duration::from_millis(10))
            .await
            .expect("held");

        let waiter_pools = pools.clone();
        let waiter = tokio::spawn(async move {
            waiter_pools
                .acquire("linting", Duration::from_secs(2))
                .await
                .map(|lease| lease.holder_id().to_string())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(held.release());

        let holder = waiter.await.expect("join").expect("admitted");
        assert!(!holder.is_empty());
    }
}
