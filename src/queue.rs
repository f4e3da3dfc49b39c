//! Bounded reads from a project's queue and exact deletion of what was
//! committed.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    config::QueueConfig,
    error::HistoryResult,
    store::QueueBackend,
    update::RawEdit,
};

/// One bounded read.
#[derive(Debug, Clone, Default)]
pub struct QueueBatch {
    /// Serialized items exactly as queued; used for deletion.
    pub raws: Vec<String>,
    /// Parsed edits, index-aligned with `raws`.
    pub edits: Vec<RawEdit>,
    /// Items may remain after this batch.
    pub has_more: bool,
}

impl QueueBatch {
    /// Nothing was read.
    pub fn is_empty(&self) -> bool {
        self.raws.is_empty()
    }

    /// Items read.
    pub fn len(&self) -> usize {
        self.raws.len()
    }
}

/// Reads and trims per-project edit queues.
#[derive(Clone)]
pub struct UpdateQueueReader {
    backend: Arc<dyn QueueBackend>,
    config: QueueConfig,
}

impl UpdateQueueReader {
    /// Reader over `backend` with the batch caps of `config`.
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        Self { backend, config }
    }

    /// Batch caps in use.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Reads up to `batch_size` items, stopping early once the byte, op or
    /// doc-content cap is reached. The item that reaches a cap is kept, so a
    /// batch always holds at least one item when the queue is not empty.
    pub async fn read_batch(&self, project_id: &str, batch_size: usize) -> HistoryResult<QueueBatch> {
        let fetched = self.backend.range(project_id, batch_size).await?;
        let fetched_len = fetched.len();

        let mut batch = QueueBatch::default();
        let (mut bytes, mut ops, mut doc_contents) = (0usize, 0usize, 0usize);
        for raw in fetched {
            let edit = RawEdit::parse(&raw)?;
            bytes += raw.len();
            ops += edit.op_count();
            if edit.is_resync_doc_content() {
                doc_contents += 1;
            }
            batch.raws.push(raw);
            batch.edits.push(edit);

            if bytes >= self.config.raw_update_size_threshold
                || ops >= self.config.max_update_op_length
                || doc_contents >= self.config.max_new_doc_content_count
            {
                break;
            }
        }

        batch.has_more = batch.len() < fetched_len || fetched_len == batch_size;
        debug!(
            project_id,
            count = batch.len(),
            bytes,
            ops,
            has_more = batch.has_more,
            "read queue batch"
        );
        Ok(batch)
    }

    /// Removes each committed item once. When every item was found and
    /// `clear_marker` is set, the first-op timestamp is cleared if the queue
    /// is now empty.
    pub async fn delete(
        &self,
        project_id: &str,
        raws: &[String],
        clear_marker: bool,
    ) -> HistoryResult<bool> {
        let mut all_removed = true;
        for raw in raws {
            if !self.backend.remove_one(project_id, raw).await? {
                all_removed = false;
            }
        }
        if !all_removed {
            warn!(project_id, count = raws.len(), "some committed updates were already gone");
            return Ok(false);
        }
        if clear_marker {
            self.clear_dangling_first_op_timestamp(project_id).await?;
        }
        Ok(true)
    }

    /// Clears the first-op timestamp of a project whose queue is empty.
    pub async fn clear_dangling_first_op_timestamp(&self, project_id: &str) -> HistoryResult<bool> {
        if self.backend.len(project_id).await? > 0 {
            return Ok(false);
        }
        if self.backend.first_op_timestamp(project_id).await?.is_none() {
            return Ok(false);
        }
        self.backend.clear_first_op_timestamp(project_id).await?;
        Ok(true)
    }

    /// Queue length.
    pub async fn count(&self, project_id: &str) -> HistoryResult<usize> {
        self.backend.len(project_id).await
    }

    /// Number of projects with at least one queued edit.
    pub async fn count_projects(&self) -> HistoryResult<usize> {
        self.backend.projects_with_queued_edits().await
    }

    /// Drops every queued edit and the first-op timestamp.
    pub async fn destroy(&self, project_id: &str) -> HistoryResult<()> {
        self.backend.destroy(project_id).await?;
        self.backend.clear_first_op_timestamp(project_id).await
    }

    /// Underlying backend, for history id caching and sweeps.
    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }
}
