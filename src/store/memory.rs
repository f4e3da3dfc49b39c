//! In-process backend behind a single async mutex.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hashbrown::HashMap;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    error::HistoryResult,
    ledger::FailureRecord,
    sync_state::SyncStateRecord,
    types::{HistoryId, ProjectId, TimestampMs, now_ms},
};

use super::{LockBackend, QueueBackend, StateBackend};

#[derive(Default)]
struct MemoryState {
    locks: HashMap<String, (String, Instant)>,
    queues: HashMap<ProjectId, VecDeque<String>>,
    first_op_timestamps: HashMap<ProjectId, TimestampMs>,
    history_ids: HashMap<ProjectId, (HistoryId, Instant)>,
    failures: HashMap<ProjectId, FailureRecord>,
    sync_states: HashMap<ProjectId, SyncStateRecord>,
}

impl MemoryState {
    fn live_lock(&mut self, key: &str) -> Option<&mut (String, Instant)> {
        let now = Instant::now();
        if self.locks.get(key).is_some_and(|(_, expiry)| *expiry <= now) {
            self.locks.remove(key);
        }
        self.locks.get_mut(key)
    }
}

/// Implements every backend trait in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> HistoryResult<bool> {
        let mut state = self.state.lock().await;
        if state.live_lock(key).is_some() {
            return Ok(false);
        }
        state
            .locks
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn extend_if_equal(&self, key: &str, value: &str, ttl: Duration) -> HistoryResult<bool> {
        let mut state = self.state.lock().await;
        match state.live_lock(key) {
            Some((current, expiry)) if current.as_str() == value => {
                *expiry = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_equal(&self, key: &str, value: &str) -> HistoryResult<bool> {
        let mut state = self.state.lock().await;
        let owned = state
            .live_lock(key)
            .is_some_and(|(current, _)| current.as_str() == value);
        if owned {
            state.locks.remove(key);
        }
        Ok(owned)
    }
}

#[async_trait]
impl QueueBackend for MemoryStore {
    async fn range(&self, project_id: &str, count: usize) -> HistoryResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(project_id)
            .map(|queue| queue.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_one(&self, project_id: &str, raw: &str) -> HistoryResult<bool> {
        let mut state = self.state.lock().await;
        let Some(queue) = state.queues.get_mut(project_id) else {
            return Ok(false);
        };
        let Some(index) = queue.iter().position(|item| item == raw) else {
            return Ok(false);
        };
        queue.remove(index);
        if queue.is_empty() {
            state.queues.remove(project_id);
        }
        Ok(true)
    }

    async fn len(&self, project_id: &str) -> HistoryResult<usize> {
        let state = self.state.lock().await;
        Ok(state.queues.get(project_id).map_or(0, VecDeque::len))
    }

    async fn push(&self, project_id: &str, raws: &[String]) -> HistoryResult<()> {
        if raws.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        state
            .queues
            .entry(project_id.to_string())
            .or_default()
            .extend(raws.iter().cloned());
        state
            .first_op_timestamps
            .entry(project_id.to_string())
            .or_insert_with(now_ms);
        Ok(())
    }

    async fn destroy(&self, project_id: &str) -> HistoryResult<()> {
        self.state.lock().await.queues.remove(project_id);
        Ok(())
    }

    async fn first_op_timestamp(&self, project_id: &str) -> HistoryResult<Option<TimestampMs>> {
        Ok(self
            .state
            .lock()
            .await
            .first_op_timestamps
            .get(project_id)
            .copied())
    }

    async fn set_first_op_timestamp_if_absent(
        &self,
        project_id: &str,
        ts: TimestampMs,
    ) -> HistoryResult<()> {
        self.state
            .lock()
            .await
            .first_op_timestamps
            .entry(project_id.to_string())
            .or_insert(ts);
        Ok(())
    }

    async fn clear_first_op_timestamp(&self, project_id: &str) -> HistoryResult<()> {
        self.state
            .lock()
            .await
            .first_op_timestamps
            .remove(project_id);
        Ok(())
    }

    async fn projects_with_first_op_timestamp(
        &self,
    ) -> HistoryResult<Vec<(ProjectId, TimestampMs)>> {
        let state = self.state.lock().await;
        let mut projects: Vec<(ProjectId, TimestampMs)> = state
            .first_op_timestamps
            .iter()
            .map(|(project_id, ts)| (project_id.clone(), *ts))
            .collect();
        projects.sort_by_key(|(_, ts)| *ts);
        Ok(projects)
    }

    async fn projects_with_queued_edits(&self) -> HistoryResult<usize> {
        let state = self.state.lock().await;
        Ok(state.queues.values().filter(|queue| !queue.is_empty()).count())
    }

    async fn cached_history_id(&self, project_id: &str) -> HistoryResult<Option<HistoryId>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some((history_id, expiry)) = state.history_ids.get(project_id) {
            if *expiry > now {
                return Ok(Some(history_id.clone()));
            }
        }
        state.history_ids.remove(project_id);
        Ok(None)
    }

    async fn cache_history_id(
        &self,
        project_id: &str,
        history_id: &str,
        ttl: Duration,
    ) -> HistoryResult<()> {
        self.state.lock().await.history_ids.insert(
            project_id.to_string(),
            (history_id.to_string(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn clear_cached_history_id(&self, project_id: &str) -> HistoryResult<()> {
        self.state.lock().await.history_ids.remove(project_id);
        Ok(())
    }
}

#[async_trait]
impl StateBackend for MemoryStore {
    async fn failure(&self, project_id: &str) -> HistoryResult<Option<FailureRecord>> {
        Ok(self.state.lock().await.failures.get(project_id).cloned())
    }

    async fn put_failure(&self, record: &FailureRecord) -> HistoryResult<()> {
        self.state
            .lock()
            .await
            .failures
            .insert(record.project_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_failure(&self, project_id: &str) -> HistoryResult<()> {
        self.state.lock().await.failures.remove(project_id);
        Ok(())
    }

    async fn failures(&self) -> HistoryResult<Vec<FailureRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<FailureRecord> = state.failures.values().cloned().collect();
        records.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        Ok(records)
    }

    async fn sync_state(&self, project_id: &str) -> HistoryResult<Option<SyncStateRecord>> {
        let mut state = self.state.lock().await;
        if state
            .sync_states
            .get(project_id)
            .is_some_and(|record| record.is_expired(Utc::now()))
        {
            state.sync_states.remove(project_id);
        }
        Ok(state.sync_states.get(project_id).cloned())
    }

    async fn put_sync_state(&self, record: &SyncStateRecord) -> HistoryResult<()> {
        self.state
            .lock()
            .await
            .sync_states
            .insert(record.project_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_sync_state(&self, project_id: &str) -> HistoryResult<()> {
        self.state.lock().await.sync_states.remove(project_id);
        Ok(())
    }
}
