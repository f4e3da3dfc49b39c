//! Per-project lease over a [`LockBackend`].
//!
//! Every value written to the backend is unique to one acquisition, so a
//! holder whose lease expired and was taken over cannot extend or release
//! the new holder's lease.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::{
    config::LockConfig,
    error::{HistoryError, HistoryResult},
    store::LockBackend,
    types::now_ms,
};

const HEALTH_CHECK_KEY: &str = "ProjectHistoryLock:{health-check}";

/// Key of the lock guarding one project's ingestion.
pub fn project_lock_key(project_id: &str) -> String {
    format!("ProjectHistoryLock:{{{project_id}}}")
}

/// Acquires leases; cheap to clone.
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
    counter: Arc<AtomicU64>,
}

impl DistributedLock {
    /// Lock over `backend` with the TTL and wait limits of `config`.
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self {
            backend,
            config,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    fn random_value(&self) -> String {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "locked:host={host}:pid={}:random={:016x}:time={}:count={count}",
            std::process::id(),
            rand::random::<u64>(),
            now_ms(),
        )
    }

    /// Polls until the key is free or `max_wait` elapses.
    pub async fn acquire(&self, key: &str) -> HistoryResult<LockLease> {
        let value = self.random_value();
        let ttl = self.config.ttl();
        let started = Instant::now();
        loop {
            if self.backend.set_if_absent(key, &value, ttl).await? {
                debug!(key, "lock acquired");
                let now = Instant::now();
                return Ok(LockLease {
                    key: key.to_string(),
                    value,
                    acquired_at: now,
                    extended_at: Mutex::new(now),
                    backend: Arc::clone(&self.backend),
                    ttl,
                    min_extension_interval: self.config.min_extension_interval(),
                });
            }
            if started.elapsed() >= self.config.max_wait() {
                return Err(HistoryError::LockTimeout {
                    key: key.to_string(),
                });
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    /// Runs `f` under the lock and releases it afterwards, whatever `f`
    /// returned. A release failure only surfaces when `f` succeeded.
    pub async fn run_locked<T, F, Fut>(&self, key: &str, f: F) -> HistoryResult<T>
    where
        F: FnOnce(Arc<LockLease>) -> Fut,
        Fut: std::future::Future<Output = HistoryResult<T>>,
    {
        let lease = Arc::new(self.acquire(key).await?);
        let result = f(Arc::clone(&lease)).await;
        let released = lease.release().await;
        match (result, released) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    /// Acquires and releases the health-check key.
    pub async fn check_lock(&self) -> HistoryResult<()> {
        let lease = self.acquire(HEALTH_CHECK_KEY).await?;
        lease.release().await
    }
}

/// A held lock. Pass it by reference to every step that may run long.
pub struct LockLease {
    key: String,
    value: String,
    acquired_at: Instant,
    extended_at: Mutex<Instant>,
    backend: Arc<dyn LockBackend>,
    ttl: Duration,
    min_extension_interval: Duration,
}

impl LockLease {
    /// Locked key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Random value proving ownership of the key.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// When the lock was taken.
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Resets the TTL if this lease still owns the key. Calls closer together
    /// than the minimum interval are skipped.
    pub async fn extend(&self) -> HistoryResult<()> {
        let mut extended_at = self.extended_at.lock().await;
        if extended_at.elapsed() < self.min_extension_interval {
            return Ok(());
        }
        if !self
            .backend
            .extend_if_equal(&self.key, &self.value, self.ttl)
            .await?
        {
            return Err(HistoryError::LockExtend {
                key: self.key.clone(),
            });
        }
        *extended_at = Instant::now();
        Ok(())
    }

    /// Deletes the key if this lease still owns it.
    pub async fn release(&self) -> HistoryResult<()> {
        let held = self.acquired_at.elapsed();
        if held > self.ttl {
            warn!(key = %self.key, held_ms = held.as_millis() as u64, "lock held past its ttl");
        }
        if !self.backend.delete_if_equal(&self.key, &self.value).await? {
            return Err(HistoryError::LockRelease {
                key: self.key.clone(),
            });
        }
        debug!(key = %self.key, "lock released");
        Ok(())
    }
}
