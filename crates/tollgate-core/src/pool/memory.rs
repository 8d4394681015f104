use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{PoolBackend, PoolStatus};
use crate::config::PoolBackendKind;
use crate::error::Result;

struct MemoryPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    permits: Mutex<HashMap<String, OwnedSemaphorePermit>>,
    waiting: AtomicUsize,
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process pools on top of tokio's fair semaphore.
#[derive(Default)]
pub struct MemoryPoolBackend {
    pools: Mutex<HashMap<String, Arc<MemoryPool>>>,
}

impl MemoryPoolBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self, name: &str, capacity: usize) -> Arc<MemoryPool> {
        let mut pools = lock(&self.pools);
        pools
            .entry(name.to_string())
            .or_insert_with(|| {
                let capacity = capacity.max(1);
                Arc::new(MemoryPool {
                    capacity,
                    semaphore: Arc::new(Semaphore::new(capacity)),
                    permits: Mutex::new(HashMap::new()),
                    waiting: AtomicUsize::new(0),
                })
            })
            .clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl PoolBackend for MemoryPoolBackend {
    fn kind(&self) -> PoolBackendKind {
        PoolBackendKind::Memory
    }

    async fn acquire(
        &self,
        pool: &str,
        capacity: usize,
        holder: &str,
        wait: Duration,
        _hold: Option<Duration>,
    ) -> Result<bool> {
        let pool = self.pool(pool, capacity);
        let permit = if wait.is_zero() {
            pool.semaphore.clone().try_acquire_owned().ok()
        } else {
            let _waiting = WaitingGuard::enter(&pool.waiting);
            match tokio::time::timeout(wait, pool.semaphore.clone().acquire_owned()).await {
                Ok(Ok(permit)) => Some(permit),
                _ => None,
            }
        };
        let Some(permit) = permit else {
            return Ok(false);
        };
        lock(&pool.permits).insert(holder.to_string(), permit);
        Ok(true)
    }

    fn release(&self, pool: &str, holder: &str) -> Result<bool> {
        let Some(pool) = lock(&self.pools).get(pool).cloned() else {
            return Ok(false);
        };
        let removed = lock(&pool.permits).remove(holder);
        Ok(removed.is_some())
    }

    async fn status(&self, pool: &str, capacity: usize) -> Result<PoolStatus> {
        let state = self.pool(pool, capacity);
        let mut holders = lock(&state.permits).keys().cloned().collect::<Vec<_>>();
        holders.sort();
        Ok(PoolStatus {
            pool: pool.to_string(),
            capacity: state.capacity,
            in_use: state.capacity - state.semaphore.available_permits().min(state.capacity),
            waiting: state.waiting.load(Ordering::SeqCst),
            holders,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capacity_from_first_reference_wins() {
        let backend = MemoryPoolBackend::new();
        assert!(backend
            .acquire("p", 1, "a", Duration::ZERO, None)
            .await
            .expect("a"));
        assert!(!backend
            .acquire("p", 5, "b", Duration::ZERO, None)
            .await
            .expect("b"));
        assert_eq!(backend.status("p", 9).await.expect("status").capacity, 1);
    }

    #[tokio::test]
    async fn waiters_are_admitted_in_arrival_order() {
        let backend = Arc::new(MemoryPoolBackend::new());
        assert!(backend
            .acquire("p", 1, "holder", Duration::ZERO, None)
            .await
            .expect("holder"));

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for name in ["first", "second", "third"] {
            let backend = backend.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let ok = backend
                    .acquire("p", 1, name, Duration::from_secs(2), None)
                    .await
                    .expect("acquire");
                assert!(ok);
                lock(&order).push(name);
                tokio::time::sleep(Duration::from_millis(5)).await;
                backend.release("p", name).expect("release");
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(backend.status("p", 1).await.expect("status").waiting, 3);

        backend.release("p", "holder").expect("release");
        for task in tasks {
            task.await.expect("join");
        }
        assert_eq!(*lock(&order), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn releasing_unknown_holder_is_a_no_op() {
        let backend = MemoryPoolBackend::new();
        assert!(!backend.release("missing", "x").expect("release"));
        assert!(backend
            .acquire("p", 1, "a", Duration::ZERO, None)
            .await
            .expect("a"));
        assert!(!backend.release("p", "b").expect("release"));
        assert_eq!(backend.status("p", 1).await.expect("status").in_use, 1);
    }
}
