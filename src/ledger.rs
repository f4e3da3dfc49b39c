//! FailureLedger: one persisted record per failing project.
//!
//! A failed run upserts the record and bumps `attempts`; a successful run
//! deletes it. The retry sweep selects records through
//! [`FailureRecord::is_soft_failure`] and [`FailureRecord::is_hard_failure`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::{
    error::{HistoryError, HistoryResult, is_hard_message, is_temporary_message},
    store::StateBackend,
    types::ProjectId,
};

/// Entries kept in [`FailureRecord::history`].
pub const MAX_FAILURE_HISTORY: usize = 10;

/// Which retry path a failure takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Replay the pipeline.
    Soft,
    /// Force a resync first.
    Hard,
}

/// One past failure or resync start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureHistoryEntry {
    /// Error message, for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error trace, for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Queue length at the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<i64>,
    /// Set on resync-start entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_started_at: Option<DateTime<Utc>>,
    /// When the entry was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

/// Persisted state of a failing project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    /// Failing project.
    pub project_id: ProjectId,
    /// Last error message.
    #[serde(default)]
    pub error: String,
    /// Last error with its context frames.
    #[serde(default)]
    pub stack: String,
    /// Queue length when the last failure happened; -1 when the failure
    /// happened while starting a resync.
    #[serde(default)]
    pub queue_size: i64,
    /// Failed runs since the last success.
    #[serde(default)]
    pub attempts: u32,
    /// Resyncs started by the hard retry path.
    #[serde(default)]
    pub resync_attempts: u32,
    /// Start of the most recent resync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_started_at: Option<DateTime<Utc>>,
    /// Newest first.
    #[serde(default)]
    pub history: Vec<FailureHistoryEntry>,
    /// Lets the baseline read ignore ordering errors.
    #[serde(default)]
    pub force_debug: bool,
    /// Times the retry sweep has picked this project.
    #[serde(default)]
    pub request_count: u32,
    /// Last update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

impl FailureRecord {
    /// Empty record for `project_id`.
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            ..Self::default()
        }
    }

    /// Last error looks transient.
    pub fn is_temporary(&self) -> bool {
        is_temporary_message(&self.error)
    }

    /// Last error needs a resync.
    pub fn is_hard(&self) -> bool {
        is_hard_message(&self.error)
    }

    /// At most one failed run.
    pub fn is_first(&self) -> bool {
        self.attempts <= 1
    }

    /// More than three failed runs.
    pub fn is_repeated(&self) -> bool {
        self.attempts > 3
    }

    /// Two resyncs did not help; left for an operator.
    pub fn is_stuck(&self) -> bool {
        self.resync_attempts >= 2
    }

    /// Candidate for a plain replay.
    pub fn is_soft_failure(&self) -> bool {
        (self.is_temporary() && !self.is_repeated()) || (self.is_first() && !self.is_hard())
    }

    /// Candidate for a resync, unless already stuck.
    pub fn is_hard_failure(&self) -> bool {
        (self.is_hard() || self.is_repeated()) && !self.is_stuck()
    }

    /// Whether the record belongs to `kind`'s sweep.
    pub fn matches(&self, kind: FailureKind) -> bool {
        match kind {
            FailureKind::Soft => self.is_soft_failure(),
            FailureKind::Hard => self.is_hard_failure(),
        }
    }

    fn push_history(&mut self, entry: FailureHistoryEntry) {
        self.history.insert(0, entry);
        self.history.truncate(MAX_FAILURE_HISTORY);
    }
}

/// Counts over every stored failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureSummary {
    /// Records stored.
    pub total: usize,
    /// Records per error message.
    pub by_error: BTreeMap<String, usize>,
    /// Records per attempt count.
    pub by_attempts: BTreeMap<u32, usize>,
    /// Records past the resync limit.
    pub stuck: usize,
}

/// Failure bookkeeping over a [`StateBackend`].
#[derive(Clone)]
pub struct FailureLedger {
    state: Arc<dyn StateBackend>,
}

impl FailureLedger {
    /// Ledger over `state`.
    pub fn new(state: Arc<dyn StateBackend>) -> Self {
        Self { state }
    }

    /// Records the outcome of a run: `None` clears the record.
    pub async fn record(
        &self,
        project_id: &str,
        queue_size: i64,
        failure: Option<&HistoryError>,
    ) -> HistoryResult<()> {
        let Some(err) = failure else {
            debug!(project_id, "clearing failure record");
            return self.state.delete_failure(project_id).await;
        };

        error!(project_id, queue_size, error = %err, "recording failure");
        let now = Utc::now();
        let message = err.to_string();
        let stack = err.trace();
        let mut record = self
            .state
            .failure(project_id)
            .await?
            .unwrap_or_else(|| FailureRecord::new(project_id));
        record.error = message.clone();
        record.stack = stack.clone();
        record.queue_size = queue_size;
        record.attempts += 1;
        record.ts = Some(now);
        record.push_history(FailureHistoryEntry {
            error: Some(message),
            stack: Some(stack),
            queue_size: Some(queue_size),
            resync_started_at: None,
            ts: Some(now),
        });
        self.state.put_failure(&record).await
    }

    /// Notes that a resync was started for the project.
    pub async fn record_sync_start(&self, project_id: &str) -> HistoryResult<()> {
        let now = Utc::now();
        let mut record = self
            .state
            .failure(project_id)
            .await?
            .unwrap_or_else(|| FailureRecord::new(project_id));
        record.resync_attempts += 1;
        record.resync_started_at = Some(now);
        record.push_history(FailureHistoryEntry {
            resync_started_at: Some(now),
            ts: Some(now),
            ..FailureHistoryEntry::default()
        });
        self.state.put_failure(&record).await
    }

    /// Sets the force-debug flag, creating the record if needed.
    pub async fn set_force_debug(&self, project_id: &str, force_debug: bool) -> HistoryResult<()> {
        let mut record = self
            .state
            .failure(project_id)
            .await?
            .unwrap_or_else(|| FailureRecord::new(project_id));
        record.force_debug = force_debug;
        self.state.put_failure(&record).await
    }

    /// Counts one pick by the retry sweep. No-op without a record.
    pub async fn increment_request_count(&self, project_id: &str) -> HistoryResult<()> {
        if let Some(mut record) = self.state.failure(project_id).await? {
            record.request_count += 1;
            self.state.put_failure(&record).await?;
        }
        Ok(())
    }

    /// Stored record, if any.
    pub async fn get_failure_record(&self, project_id: &str) -> HistoryResult<Option<FailureRecord>> {
        self.state.failure(project_id).await
    }

    /// Whether ordering errors in committed history are tolerated.
    pub async fn force_debug(&self, project_id: &str) -> HistoryResult<bool> {
        Ok(self
            .state
            .failure(project_id)
            .await?
            .is_some_and(|record| record.force_debug))
    }

    /// Records selected by `kind`.
    pub async fn failed_projects(&self, kind: FailureKind) -> HistoryResult<Vec<FailureRecord>> {
        Ok(self
            .state
            .failures()
            .await?
            .into_iter()
            .filter(|record| record.matches(kind))
            .collect())
    }

    /// Summary over every record.
    pub async fn get_failures(&self) -> HistoryResult<FailureSummary> {
        let mut summary = FailureSummary::default();
        for record in self.state.failures().await? {
            summary.total += 1;
            *summary.by_error.entry(record.error.clone()).or_default() += 1;
            *summary.by_attempts.entry(record.attempts).or_default() += 1;
            if record.is_stuck() {
                summary.stuck += 1;
            }
        }
        Ok(summary)
    }

    /// Deletes the record.
    pub async fn clear_error(&self, project_id: &str) -> HistoryResult<()> {
        self.state.delete_failure(project_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::{FailureKind, FailureRecord};

    fn record(error: &str, attempts: u32, resync_attempts: u32) -> FailureRecord {
        FailureRecord {
            error: error.to_string(),
            attempts,
            resync_attempts,
            ..FailureRecord::new("p1")
        }
    }

    #[test]
    fn selectors_partition_failures() {
        let first_format = record("update with unknown format", 1, 0);
        assert!(first_format.matches(FailureKind::Soft));
        assert!(!first_format.matches(FailureKind::Hard));

        let flaky = record("timeout: http://store", 3, 0);
        assert!(flaky.matches(FailureKind::Soft));

        let repeated = record("timeout: http://store", 4, 0);
        assert!(!repeated.matches(FailureKind::Soft));
        assert!(repeated.matches(FailureKind::Hard));

        let rejected = record("history store returned a non-success status code: 422", 1, 0);
        assert!(!rejected.matches(FailureKind::Soft));
        assert!(rejected.matches(FailureKind::Hard));

        let stuck = record("doc version out of order", 9, 2);
        assert!(!stuck.matches(FailureKind::Soft));
        assert!(!stuck.matches(FailureKind::Hard));
    }
}
