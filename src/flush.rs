//! Sweep that flushes projects whose oldest queued edit has waited too long.

use std::time::Duration;

use futures::{StreamExt, stream};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    config::FlushConfig,
    error::HistoryResult,
    pipeline::IngestionPipeline,
    types::{ProjectId, now_ms},
};

/// Parameters of one flush sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushOptions {
    /// Minimum age of a project's oldest queued edit.
    pub max_age: Duration,
    /// Most projects selected.
    pub limit: usize,
    /// No project is started after this much time.
    pub timeout: Duration,
    /// Projects processed at once.
    pub concurrency: usize,
}

impl From<&FlushConfig> for FlushOptions {
    fn from(config: &FlushConfig) -> Self {
        Self {
            max_age: config.max_age(),
            limit: config.limit,
            timeout: config.timeout(),
            concurrency: config.concurrency,
        }
    }
}

/// Outcome of a flush sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Projects processed without error.
    pub succeeded: Vec<ProjectId>,
    /// Projects whose run failed.
    pub failed: Vec<ProjectId>,
    /// Every selected project, including those skipped once time ran out.
    pub all: Vec<ProjectId>,
}

/// Projects whose first-op timestamp is older than `max_age`, oldest first.
pub async fn old_projects(
    pipeline: &IngestionPipeline,
    max_age: Duration,
    limit: usize,
) -> HistoryResult<Vec<ProjectId>> {
    let cutoff = now_ms() - max_age.as_millis() as i64;
    let mut projects: Vec<_> = pipeline
        .queue()
        .backend()
        .projects_with_first_op_timestamp()
        .await?
        .into_iter()
        .filter(|(_, ts)| *ts <= cutoff)
        .collect();
    projects.sort_by_key(|(_, ts)| *ts);
    Ok(projects
        .into_iter()
        .take(limit)
        .map(|(project_id, _)| project_id)
        .collect())
}

/// Runs the pipeline for every old project with bounded concurrency. Projects
/// not started before the timeout are skipped; started ones run to the end.
pub async fn flush_old_ops(
    pipeline: &IngestionPipeline,
    options: &FlushOptions,
) -> HistoryResult<FlushReport> {
    let all = old_projects(pipeline, options.max_age, options.limit).await?;
    info!(count = all.len(), "flushing old ops");
    let deadline = Instant::now() + options.timeout;

    let outcomes: Vec<(ProjectId, Option<bool>)> = stream::iter(all.iter().cloned())
        .map(|project_id| async move {
            if Instant::now() >= deadline {
                return (project_id, None);
            }
            match pipeline.process_updates_for_project(&project_id).await {
                Ok(()) => (project_id, Some(true)),
                Err(err) => {
                    warn!(%project_id, error = %err, "failed to flush old ops");
                    (project_id, Some(false))
                }
            }
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    let mut report = FlushReport {
        all,
        ..FlushReport::default()
    };
    for (project_id, outcome) in outcomes {
        match outcome {
            Some(true) => report.succeeded.push(project_id),
            Some(false) => report.failed.push(project_id),
            None => debug!(%project_id, "flush skipped, out of time"),
        }
    }
    Ok(report)
}
