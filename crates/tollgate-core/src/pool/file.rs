use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{PoolBackend, PoolStatus};
use crate::config::PoolBackendKind;
use crate::error::{Result, TollgateError};
use crate::storage_paths::{now_ms, write_json_atomic};

/// Waiting tickets not refreshed for this long belong to a waiter that is gone.
const TICKET_STALE_MS: u64 = 2_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct HolderEntry {
    id: String,
    pid: u32,
    acquired_at_ms: u64,
    /// How long the holder intends to keep the slot. Absent means the slot
    /// is only reclaimed once the owning process is gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hold_ms: Option<u64>,
}

impl HolderEntry {
    /// A holder is abandoned when its process died, or when it outlived its
    /// declared hold by more than the stale grace (pid reuse, stuck release).
    fn is_abandoned(&self, now: u64, stale_grace_ms: u64) -> bool {
        if !process_alive(self.pid) {
            return true;
        }
        match self.hold_ms {
            Some(hold_ms) => {
                now.saturating_sub(self.acquired_at_ms) >= hold_ms.saturating_add(stale_grace_ms)
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct QueueTicket {
    id: String,
    pid: u32,
    enqueued_at_ms: u64,
    seen_at_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PoolState {
    #[serde(default)]
    capacity: usize,
    #[serde(default)]
    holders: Vec<HolderEntry>,
    #[serde(default)]
    queue: Vec<QueueTicket>,
}

impl PoolState {
    fn load(path: &Path) -> Self {
        let Ok(raw) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!("resetting corrupt pool state {}: {}", path.display(), err);
                Self::default()
            }
        }
    }

    fn prune(&mut self, now: u64, stale_grace_ms: u64) -> Vec<HolderEntry> {
        let (stale, live): (Vec<_>, Vec<_>) = self
            .holders
            .drain(..)
            .partition(|holder| holder.is_abandoned(now, stale_grace_ms));
        self.holders = live;
        self.queue.retain(|ticket| {
            process_alive(ticket.pid) && now.saturating_sub(ticket.seen_at_ms) < TICKET_STALE_MS
        });
        stale
    }
}

/// Pools shared across processes: `<lock_dir>/<pool>.json` holds the
/// holders and the FIFO queue of waiters, guarded by an exclusive lock on
/// `<lock_dir>/<pool>.lock`.
#[derive(Debug, Clone)]
pub struct FilePoolBackend {
    lock_dir: PathBuf,
    poll_interval: Duration,
    stale_lease: Duration,
}

impl FilePoolBackend {
    pub fn new(lock_dir: PathBuf, poll_interval: Duration, stale_lease: Duration) -> Self {
        Self {
            lock_dir,
            poll_interval,
            stale_lease,
        }
    }

    fn with_state<T>(
        &self,
        pool: &str,
        capacity: usize,
        operation: impl FnOnce(&mut PoolState) -> T,
    ) -> io::Result<T> {
        fs::create_dir_all(&self.lock_dir)?;
        let stem = sanitize_pool_name(pool);
        let lock_path = self.lock_dir.join(format!("{stem}.lock"));
        let state_path = self.lock_dir.join(format!("{stem}.json"));
        let lock_file: File = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        FileExt::lock_exclusive(&lock_file)?;

        let mut state = PoolState::load(&state_path);
        if state.capacity == 0 {
            state.capacity = capacity.max(1);
        }
        let stale = state.prune(now_ms(), self.stale_lease.as_millis() as u64);
        for holder in &stale {
            tracing::warn!(
                "recovered stale lease {} (pid {}) in pool `{}`",
                holder.id,
                holder.pid,
                pool
            );
        }
        let result = operation(&mut state);
        let written = write_json_atomic(&state_path, &state);
        let _ = FileExt::unlock(&lock_file);
        written.map(|_| result)
    }

    /// One admission attempt. Queues the ticket on first sight and admits it
    /// once it is within the free slots at the head of the queue.
    fn try_admit(
        &self,
        pool: &str,
        capacity: usize,
        holder: &str,
        hold: Option<Duration>,
    ) -> io::Result<bool> {
        let pid = std::process::id();
        self.with_state(pool, capacity, |state| {
            let now = now_ms();
            match state.queue.iter_mut().find(|ticket| ticket.id == holder) {
                Some(ticket) => ticket.seen_at_ms = now,
                None => state.queue.push(QueueTicket {
                    id: holder.to_string(),
                    pid,
                    enqueued_at_ms: now,
                    seen_at_ms: now,
                }),
            }
            let free = state.capacity.saturating_sub(state.holders.len());
            let position = state.queue.iter().position(|ticket| ticket.id == holder);
            match position {
                Some(position) if position < free => {
                    state.queue.remove(position);
                    state.holders.push(HolderEntry {
                        id: holder.to_string(),
                        pid,
                        acquired_at_ms: now,
                        hold_ms: hold.map(|hold| hold.as_millis() as u64),
                    });
                    true
                }
                _ => false,
            }
        })
    }

    fn withdraw(&self, pool: &str, holder: &str) -> io::Result<()> {
        self.with_state(pool, 1, |state| {
            state.queue.retain(|ticket| ticket.id != holder);
        })
    }

    async fn admit_step(
        &self,
        pool: &str,
        capacity: usize,
        holder: &str,
        hold: Option<Duration>,
    ) -> Result<bool> {
        let this = self.clone();
        let pool = pool.to_string();
        let holder = holder.to_string();
        tokio::task::spawn_blocking(move || this.try_admit(&pool, capacity, &holder, hold))
            .await
            .map_err(|err| TollgateError::Io(io::Error::other(err)))?
            .map_err(TollgateError::from)
    }

    async fn withdraw_step(&self, pool: &str, holder: &str) -> Result<()> {
        let this = self.clone();
        let pool = pool.to_string();
        let holder = holder.to_string();
        tokio::task::spawn_blocking(move || this.withdraw(&pool, &holder))
            .await
            .map_err(|err| TollgateError::Io(io::Error::other(err)))?
            .map_err(TollgateError::from)
    }
}

/// Removes this waiter's ticket when the acquire is cancelled or fails
/// before it could withdraw on its own.
struct TicketGuard<'a> {
    backend: &'a FilePoolBackend,
    pool: &'a str,
    holder: &'a str,
    armed: bool,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.backend.withdraw(self.pool, self.holder) {
            tracing::debug!("failed to withdraw ticket {}: {}", self.holder, err);
        }
    }
}

#[async_trait]
impl PoolBackend for FilePoolBackend {
    fn kind(&self) -> PoolBackendKind {
        PoolBackendKind::File
    }

    async fn acquire(
        &self,
        pool: &str,
        capacity: usize,
        holder: &str,
        wait: Duration,
        hold: Option<Duration>,
    ) -> Result<bool> {
        let deadline = Instant::now() + wait;
        let mut guard = TicketGuard {
            backend: self,
            pool,
            holder,
            armed: true,
        };
        loop {
            if self.admit_step(pool, capacity, holder, hold).await? {
                guard.armed = false;
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                self.withdraw_step(pool, holder).await?;
                guard.armed = false;
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    fn release(&self, pool: &str, holder: &str) -> Result<bool> {
        let removed = self.with_state(pool, 1, |state| {
            let before = state.holders.len();
            state.holders.retain(|entry| entry.id != holder);
            state.holders.len() != before
        })?;
        Ok(removed)
    }

    async fn status(&self, pool: &str, capacity: usize) -> Result<PoolStatus> {
        let this = self.clone();
        let name = pool.to_string();
        let state = tokio::task::spawn_blocking(move || this.with_state(&name, capacity, |s| s.clone()))
            .await
            .map_err(|err| TollgateError::Io(io::Error::other(err)))??;
        Ok(PoolStatus {
            pool: pool.to_string(),
            capacity: state.capacity,
            in_use: state.holders.len(),
            waiting: state.queue.len(),
            holders: state.holders.into_iter().map(|h| h.id).collect(),
        })
    }
}

fn sanitize_pool_name(pool: &str) -> String {
    let cleaned = pool
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    if cleaned.is_empty() || cleaned.starts_with('.') {
        format!("pool{cleaned}")
    } else {
        cleaned
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if proc_root.join("self").exists() {
        return proc_root.join(pid.to_string()).exists();
    }
    signal_zero(pid)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// `kill -0` delivers nothing; it only reports whether `pid` exists.
#[cfg(unix)]
fn signal_zero(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}
