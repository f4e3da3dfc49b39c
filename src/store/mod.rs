//! Shared-store backends: lock primitives, the per-project edit queue and
//! the persisted per-project records (failures, sync state).
//!
//! Two implementations share these traits: [`memory::MemoryStore`] for tests
//! and single-process use, and [`sqlite::SqliteStore`] for a durable store
//! shared by worker processes on one host.

/// In-process backend.
pub mod memory;
/// SQLite backend.
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::HistoryResult,
    ledger::FailureRecord,
    sync_state::SyncStateRecord,
    types::{HistoryId, ProjectId, TimestampMs},
};

/// Atomic primitives behind [`crate::lock::DistributedLock`].
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Sets `key` to `value` with a TTL unless a live value exists.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> HistoryResult<bool>;

    /// Resets the TTL only while the live value equals `value`.
    async fn extend_if_equal(&self, key: &str, value: &str, ttl: Duration) -> HistoryResult<bool>;

    /// Deletes `key` only while the live value equals `value`.
    async fn delete_if_equal(&self, key: &str, value: &str) -> HistoryResult<bool>;
}

/// Ordered per-project queue of serialized raw edits plus its side keys.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Up to `count` items from the head of the queue, oldest first.
    async fn range(&self, project_id: &str, count: usize) -> HistoryResult<Vec<String>>;

    /// Removes the first item equal to `raw`; false when none matched.
    async fn remove_one(&self, project_id: &str, raw: &str) -> HistoryResult<bool>;

    /// Queue length.
    async fn len(&self, project_id: &str) -> HistoryResult<usize>;

    /// Producer side: appends items and stamps the first-op timestamp if unset.
    async fn push(&self, project_id: &str, raws: &[String]) -> HistoryResult<()>;

    /// Drops every queued item of the project.
    async fn destroy(&self, project_id: &str) -> HistoryResult<()>;

    /// When the oldest unflushed item was queued.
    async fn first_op_timestamp(&self, project_id: &str) -> HistoryResult<Option<TimestampMs>>;

    /// Stamps the first-op timestamp unless one is set.
    async fn set_first_op_timestamp_if_absent(
        &self,
        project_id: &str,
        ts: TimestampMs,
    ) -> HistoryResult<()>;

    /// Removes the first-op timestamp.
    async fn clear_first_op_timestamp(&self, project_id: &str) -> HistoryResult<()>;

    /// Every project carrying a first-op timestamp.
    async fn projects_with_first_op_timestamp(
        &self,
    ) -> HistoryResult<Vec<(ProjectId, TimestampMs)>>;

    /// Number of projects with at least one queued item.
    async fn projects_with_queued_edits(&self) -> HistoryResult<usize>;

    /// Cached history id, unless expired.
    async fn cached_history_id(&self, project_id: &str) -> HistoryResult<Option<HistoryId>>;

    /// Caches a history id for `ttl`.
    async fn cache_history_id(
        &self,
        project_id: &str,
        history_id: &str,
        ttl: Duration,
    ) -> HistoryResult<()>;

    /// Drops the cached history id.
    async fn clear_cached_history_id(&self, project_id: &str) -> HistoryResult<()>;
}

/// Persisted per-project records owned by this service.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Failure record of the project.
    async fn failure(&self, project_id: &str) -> HistoryResult<Option<FailureRecord>>;

    /// Upserts a failure record.
    async fn put_failure(&self, record: &FailureRecord) -> HistoryResult<()>;

    /// Deletes a failure record.
    async fn delete_failure(&self, project_id: &str) -> HistoryResult<()>;

    /// Every failure record.
    async fn failures(&self) -> HistoryResult<Vec<FailureRecord>>;

    /// Current sync state record; expired records read as absent.
    async fn sync_state(&self, project_id: &str) -> HistoryResult<Option<SyncStateRecord>>;

    /// Upserts a sync state record.
    async fn put_sync_state(&self, record: &SyncStateRecord) -> HistoryResult<()>;

    /// Deletes a sync state record.
    async fn delete_sync_state(&self, project_id: &str) -> HistoryResult<()>;
}
