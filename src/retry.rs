//! RetrySweeper: replays soft failures and forces a resync for hard ones.
//!
//! A sweep takes a random sample of matching failure records, bounded by a
//! count and a wall-clock budget. Once the budget runs out no new project is
//! started; the one in flight finishes.

use std::time::Duration;

use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::{
    config::RetryConfig,
    error::{HistoryError, HistoryResult},
    ledger::{FailureKind, FailureRecord},
    pipeline::IngestionPipeline,
    resync::ResyncOptions,
    types::ProjectId,
};

/// A project the sweep could not fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryFailure {
    /// Project retried.
    pub project_id: ProjectId,
    /// Error of the retry.
    pub error: String,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    /// Projects whose retry succeeded.
    pub succeeded: Vec<ProjectId>,
    /// Projects whose retry failed.
    pub failed: Vec<RetryFailure>,
}

/// Runs retry sweeps over the failure ledger.
#[derive(Clone)]
pub struct RetrySweeper {
    pipeline: IngestionPipeline,
    config: RetryConfig,
}

impl RetrySweeper {
    /// Sweeper using `pipeline` and its retry configuration.
    pub fn new(pipeline: IngestionPipeline) -> Self {
        let config = pipeline.config().retry.clone();
        Self { pipeline, config }
    }

    /// Retries up to `limit` failures of `kind` within `timeout`. `None`
    /// takes the configured default.
    pub async fn retry_failures(
        &self,
        kind: FailureKind,
        limit: Option<usize>,
        timeout: Option<Duration>,
    ) -> HistoryResult<RetryReport> {
        let limit = limit.unwrap_or(self.config.limit);
        let deadline = Instant::now() + timeout.unwrap_or_else(|| self.config.timeout());

        let mut candidates = self.pipeline.ledger().failed_projects(kind).await?;
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(limit);
        info!(?kind, count = candidates.len(), "retrying failed projects");

        let mut report = RetryReport::default();
        for record in candidates {
            if Instant::now() >= deadline {
                warn!(?kind, "retry sweep ran out of time");
                break;
            }
            let project_id = record.project_id.clone();
            self.pipeline
                .ledger()
                .increment_request_count(&project_id)
                .await?;
            let result = match kind {
                FailureKind::Soft => self.retry_soft(&project_id).await,
                FailureKind::Hard => self.retry_hard(&record).await,
            };
            match result {
                Ok(()) => {
                    debug!(%project_id, "retry succeeded");
                    report.succeeded.push(project_id);
                }
                Err(err) => {
                    warn!(%project_id, error = %err, "retry failed");
                    report.failed.push(RetryFailure {
                        project_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn retry_soft(&self, project_id: &str) -> HistoryResult<()> {
        self.pipeline.process_updates_for_project(project_id).await
    }

    /// A project that already had a resync gets a hard one, which also drops
    /// its queue.
    async fn retry_hard(&self, record: &FailureRecord) -> HistoryResult<()> {
        let project_id = record.project_id.as_str();
        let options = ResyncOptions::default();
        if record.resync_attempts > 0 {
            self.pipeline
                .resync()
                .start_hard_resync(project_id, &options)
                .await?;
        } else {
            self.pipeline
                .resync()
                .start_resync(project_id, &options)
                .await?;
        }
        self.drain_queue(project_id).await?;

        if self.pipeline.ledger().get_failure_record(project_id).await?.is_some() {
            return Err(HistoryError::FailureRecordNotCleared);
        }
        Ok(())
    }

    /// Processes until the queue is empty, polling for resync edits that the
    /// metadata service queues after the request returns.
    async fn drain_queue(&self, project_id: &str) -> HistoryResult<()> {
        let deadline = Instant::now() + self.config.drain_timeout();
        loop {
            self.pipeline.process_updates_for_project(project_id).await?;
            let remaining = self.pipeline.queue().count(project_id).await?;
            if remaining == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HistoryError::QueueNotDrained { remaining });
            }
            sleep(self.config.drain_poll_interval()).await;
        }
    }
}
