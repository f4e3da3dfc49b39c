//! IngestionPipeline: drains a project's queue into the chunk store under the
//! project lock.
//!
//! One batch goes through: history id resolution, skipping during sync,
//! baseline fetch, resync expansion, idempotence filtering, compression, blob
//! creation, translation, commit, sync state persistence, and finally queue
//! deletion. Commit happens before deletion, so a crash in between means the
//! batch is read again and filtered out by the baseline.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    blob::BlobStore,
    change::Change,
    chunk::{Baseline, ChunkResponse},
    clients::{ChunkStoreClient, FileStoreClient, MetadataClient, SendChangesOutcome},
    compress::OperationCompressor,
    config::Config,
    error::{HistoryError, HistoryResult, ResultExt},
    ledger::FailureLedger,
    lock::{DistributedLock, LockLease, project_lock_key},
    queue::{QueueBatch, UpdateQueueReader},
    resync::{ResyncCoordinator, ResyncOptions},
    store::{LockBackend, QueueBackend, StateBackend},
    translate::convert_to_changes,
    types::{HistoryId, Origin, ProjectId},
    update::RawEdit,
    version::Version,
};

/// Above this many changes per request a warning is logged.
pub const MAX_CHANGES_PER_REQUEST: usize = 1000;
/// Above this many serialized bytes per request a warning is logged.
pub const MAX_CHANGE_BYTES: usize = 1024 * 1024;

const HISTORY_STORE_RESYNC_ORIGIN: &str = "history-store-resync";

/// Every backend and client the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Project locks.
    pub locks: Arc<dyn LockBackend>,
    /// Pending edit queues.
    pub queue: Arc<dyn QueueBackend>,
    /// Failure records, sync state and the history id cache.
    pub state: Arc<dyn StateBackend>,
    /// Committed history and blobs.
    pub chunk_store: Arc<dyn ChunkStoreClient>,
    /// History ids and resync requests.
    pub metadata: Arc<dyn MetadataClient>,
    /// Binary file content.
    pub file_store: Arc<dyn FileStoreClient>,
}

impl Collaborators {
    /// Uses one store for locks, queue and state.
    pub fn from_store<S>(
        store: Arc<S>,
        chunk_store: Arc<dyn ChunkStoreClient>,
        metadata: Arc<dyn MetadataClient>,
        file_store: Arc<dyn FileStoreClient>,
    ) -> Self
    where
        S: LockBackend + QueueBackend + StateBackend + 'static,
    {
        Self {
            locks: store.clone(),
            queue: store.clone(),
            state: store,
            chunk_store,
            metadata,
            file_store,
        }
    }
}

/// Read-only view of what would be processed next.
#[derive(Debug, Clone)]
pub struct RawUpdatesDump {
    /// Project inspected.
    pub project_id: ProjectId,
    /// History id, when the project has one.
    pub history_id: Option<HistoryId>,
    /// Latest chunk of that history.
    pub chunk: Option<ChunkResponse>,
    /// Next batch of queued edits, parsed.
    pub updates: Vec<RawEdit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// Process batches until the queue is empty.
    Drain,
    /// Process one batch and leave the first-op timestamp alone.
    SingleStep,
}

/// Moves queued edits into the chunk store, one project at a time.
#[derive(Clone)]
pub struct IngestionPipeline {
    config: Config,
    queue: UpdateQueueReader,
    lock: DistributedLock,
    ledger: FailureLedger,
    resync: ResyncCoordinator,
    metadata: Arc<dyn MetadataClient>,
    chunk_store: Arc<dyn ChunkStoreClient>,
    blobs: BlobStore,
    compressor: OperationCompressor,
}

impl IngestionPipeline {
    /// Wires the components up from `config` and `collaborators`.
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let queue = UpdateQueueReader::new(collaborators.queue, config.queue.clone());
        let lock = DistributedLock::new(collaborators.locks, config.lock.clone());
        let ledger = FailureLedger::new(collaborators.state.clone());
        let resync = ResyncCoordinator::new(
            collaborators.state,
            ledger.clone(),
            collaborators.metadata.clone(),
            collaborators.chunk_store.clone(),
            lock.clone(),
            queue.clone(),
            config.compressor.diff_timeout(),
        );
        let blobs = BlobStore::new(
            collaborators.chunk_store.clone(),
            collaborators.file_store,
            config.blobs.clone(),
        );
        Self {
            config: config.clone(),
            queue,
            lock,
            ledger,
            resync,
            metadata: collaborators.metadata,
            chunk_store: collaborators.chunk_store,
            blobs,
            compressor: OperationCompressor::new(&config.compressor),
        }
    }

    /// Configuration the pipeline was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Queue reader.
    pub fn queue(&self) -> &UpdateQueueReader {
        &self.queue
    }

    /// Project lock.
    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Failure ledger.
    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    /// Resync coordinator.
    pub fn resync(&self) -> &ResyncCoordinator {
        &self.resync
    }

    /// Drains the project's queue and records the outcome in the ledger.
    pub async fn process_updates_for_project(&self, project_id: &str) -> HistoryResult<()> {
        let batch_size = self.config.queue.read_batch_size;
        let (queue_size, result) = self
            .run_locked(project_id, batch_size, RunMode::Drain, None)
            .await;
        self.finish_run(project_id, queue_size, result).await
    }

    /// Processes one queued edit. The first-op timestamp is left for the
    /// next full flush to clear.
    pub async fn process_single_update_for_project(&self, project_id: &str) -> HistoryResult<()> {
        let (queue_size, result) = self
            .run_locked(project_id, 1, RunMode::SingleStep, None)
            .await;
        self.ledger
            .record(project_id, queue_size as i64, result.as_ref().err())
            .await?;
        result
    }

    /// Processes with batches of `amount`, halving it after every failure
    /// until the queue is empty or the batch size reaches zero.
    pub async fn process_updates_for_project_using_bisect(
        &self,
        project_id: &str,
        amount: usize,
    ) -> HistoryResult<()> {
        let mut amount = amount;
        loop {
            let (queue_size, result) = self
                .run_locked(project_id, amount, RunMode::Drain, None)
                .await;
            if amount == 0 || queue_size == 0 {
                if let Err(err) = &result {
                    self.ledger
                        .record(project_id, queue_size as i64, Some(err))
                        .await?;
                }
                return result;
            }
            if let Err(err) = result {
                debug!(project_id, amount, error = %err, "bisecting batch size");
                amount /= 2;
            }
        }
    }

    /// Starts a resync and drains the queue in the same lock hold, so no
    /// other worker flushes the resync edits in between.
    pub async fn start_resync_and_process_updates_under_lock(
        &self,
        project_id: &str,
        options: &ResyncOptions,
    ) -> HistoryResult<()> {
        let batch_size = self.config.queue.read_batch_size;
        let (queue_size, result) = self
            .run_locked(project_id, batch_size, RunMode::Drain, Some(options))
            .await;
        self.finish_run(project_id, queue_size, result).await
    }

    async fn finish_run(
        &self,
        project_id: &str,
        queue_size: usize,
        result: HistoryResult<()>,
    ) -> HistoryResult<()> {
        self.ledger
            .record(project_id, queue_size as i64, result.as_ref().err())
            .await?;
        if let Err(err) = self.queue.clear_dangling_first_op_timestamp(project_id).await {
            warn!(project_id, error = %err, "failed to clear first op timestamp");
        }
        result
    }

    /// Acquires the project lock, processes, and always releases. Returns the
    /// queue size seen under the lock alongside the outcome.
    async fn run_locked(
        &self,
        project_id: &str,
        batch_size: usize,
        mode: RunMode,
        resync: Option<&ResyncOptions>,
    ) -> (usize, HistoryResult<()>) {
        let lease = match self.lock.acquire(&project_lock_key(project_id)).await {
            Ok(lease) => lease,
            Err(err) => return (0, Err(err)),
        };

        let mut queue_size = 0;
        let result = async {
            if let Some(options) = resync {
                self.resync
                    .start_resync_without_lock(project_id, options)
                    .await?;
                lease.extend().await?;
            }
            queue_size = self.queue.count(project_id).await?;
            if queue_size == 0 {
                debug!(project_id, "no updates to process");
                return Ok(());
            }
            debug!(project_id, queue_size, "processing queued updates");
            self.process_queue(project_id, &lease, batch_size, mode).await
        }
        .await
        .context("process_updates_for_project", project_id);

        let released = lease.release().await;
        let result = match (result, released) {
            (Err(err), _) => Err(err),
            (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => Ok(()),
        };
        (queue_size, result)
    }

    async fn process_queue(
        &self,
        project_id: &str,
        lease: &LockLease,
        batch_size: usize,
        mode: RunMode,
    ) -> HistoryResult<()> {
        loop {
            let batch = self.queue.read_batch(project_id, batch_size).await?;
            if batch.is_empty() {
                return Ok(());
            }
            self.process_batch(project_id, &batch, lease, mode).await?;
            if mode == RunMode::SingleStep || !batch.has_more {
                return Ok(());
            }
        }
    }

    async fn process_batch(
        &self,
        project_id: &str,
        batch: &QueueBatch,
        lease: &LockLease,
        mode: RunMode,
    ) -> HistoryResult<()> {
        let clear_marker = mode == RunMode::Drain;
        let Some(history_id) = self.get_history_id(project_id, &batch.edits).await? else {
            debug!(project_id, "discarding updates as project does not use history");
            self.queue.delete(project_id, &batch.raws, clear_marker).await?;
            return Ok(());
        };

        let outcome = self
            .process_updates(project_id, &history_id, batch.edits.clone(), &batch.raws, lease)
            .await
            .history_context("process_updates", project_id, &history_id)?;
        self.queue.delete(project_id, &batch.raws, clear_marker).await?;

        if outcome.resync_needed {
            warn!(project_id, %history_id, "history store requested a resync");
            let options = ResyncOptions {
                origin: Some(Origin::kind(HISTORY_STORE_RESYNC_ORIGIN)),
                structure_only: false,
            };
            self.resync
                .start_resync_without_lock(project_id, &options)
                .await?;
        }
        Ok(())
    }

    /// Resolves the history id from the edits and the metadata service.
    ///
    /// `None` means the project has no history and its edits are dropped.
    pub async fn get_history_id(
        &self,
        project_id: &str,
        edits: &[RawEdit],
    ) -> HistoryResult<Option<HistoryId>> {
        let mut from_updates: Option<&str> = None;
        for id in edits.iter().filter_map(|edit| edit.project_history_id.as_deref()) {
            match from_updates {
                None => from_updates = Some(id),
                Some(first) if first != id => {
                    return Err(HistoryError::InconsistentHistoryId {
                        first: first.to_string(),
                        second: id.to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        let from_metadata = match self.cached_history_id(project_id).await {
            Ok(id) => id,
            Err(err) => match from_updates {
                Some(id) => {
                    warn!(project_id, error = %err, "metadata lookup failed, using history id from updates");
                    return Ok(Some(id.to_string()));
                }
                None => return Err(err),
            },
        };

        match (from_metadata, from_updates) {
            (None, None) => Ok(None),
            (Some(id), None) => Ok(Some(id)),
            (None, Some(id)) => Ok(Some(id.to_string())),
            (Some(from_metadata), Some(from_updates)) if from_metadata != from_updates => {
                warn!(project_id, %from_metadata, from_updates, "inconsistent project history id");
                Err(HistoryError::HistoryIdMismatch {
                    from_updates: from_updates.to_string(),
                    from_metadata,
                })
            }
            (Some(id), Some(_)) => Ok(Some(id)),
        }
    }

    async fn cached_history_id(&self, project_id: &str) -> HistoryResult<Option<HistoryId>> {
        let backend = self.queue.backend();
        if let Some(id) = backend.cached_history_id(project_id).await? {
            return Ok(Some(id));
        }
        let id = self.metadata.get_history_id(project_id).await?;
        if let Some(id) = &id {
            backend
                .cache_history_id(project_id, id, self.config.queue.history_id_cache_ttl())
                .await?;
        }
        Ok(id)
    }

    async fn process_updates(
        &self,
        project_id: &str,
        history_id: &str,
        edits: Vec<RawEdit>,
        raws: &[String],
        lease: &LockLease,
    ) -> HistoryResult<SendChangesOutcome> {
        let (edits, sync_state) = self
            .resync
            .skip_updates_during_sync(project_id, edits)
            .await
            .history_context("skip_updates_during_sync", project_id, history_id)?;
        if edits.is_empty() {
            self.resync.set_resync_state(project_id, sync_state).await?;
            return Ok(SendChangesOutcome::default());
        }

        let (baseline, chunk) = self
            .get_most_recent_version_with_debug(project_id, history_id)
            .await?;

        let expanded = self
            .resync
            .expand_sync_updates(project_id, history_id, &chunk.chunk, edits, raws, lease)
            .await
            .history_context("expand_sync_updates", project_id, history_id)?;
        let unapplied = skip_already_applied_updates(project_id, expanded, &baseline)
            .history_context("skip_already_applied_updates", project_id, history_id)?;
        let compressed = self.compressor.compress(unapplied)?;
        let with_blobs = self
            .blobs
            .create_blobs_for_updates(project_id, history_id, compressed, lease)
            .await
            .history_context("create_blobs", project_id, history_id)?;
        let changes = convert_to_changes(project_id, &with_blobs)
            .history_context("convert_to_changes", project_id, history_id)?;
        log_change_telemetry(project_id, &changes)?;

        // the commit is usually the longest request
        lease.extend().await?;
        let outcome = if changes.is_empty() {
            SendChangesOutcome::default()
        } else {
            self.chunk_store
                .send_changes(history_id, &changes, baseline.version)
                .await
                .history_context("send_changes", project_id, history_id)?
        };

        self.resync.set_resync_state(project_id, sync_state).await?;
        Ok(outcome)
    }

    /// Baseline from the latest chunk. An ordering violation in stored
    /// history is only tolerated while the project's failure record has
    /// `force_debug` set.
    async fn get_most_recent_version_with_debug(
        &self,
        project_id: &str,
        history_id: &str,
    ) -> HistoryResult<(Baseline, ChunkResponse)> {
        let chunk = self
            .chunk_store
            .latest_chunk(history_id)
            .await
            .history_context("get_most_recent_chunk", project_id, history_id)?;
        let report = Baseline::from_chunk(&chunk.chunk)?;
        if let Some(err) = report.ordering_error {
            if !self.ledger.force_debug(project_id).await? {
                return Err(err);
            }
            warn!(project_id, history_id, error = %err, "ops out of order in chunk, forced continue");
        }
        Ok((report.baseline, chunk))
    }

    /// Parses the next batch and fetches what it would be checked against,
    /// without changing anything.
    pub async fn get_raw_updates(
        &self,
        project_id: &str,
        batch_size: usize,
    ) -> HistoryResult<RawUpdatesDump> {
        let batch = self.queue.read_batch(project_id, batch_size).await?;
        let history_id = self.get_history_id(project_id, &batch.edits).await?;
        let chunk = match &history_id {
            Some(id) => Some(self.chunk_store.latest_chunk(id).await?),
            None => None,
        };
        Ok(RawUpdatesDump {
            project_id: project_id.to_string(),
            history_id,
            chunk,
            updates: batch.edits,
        })
    }

    /// Forgets everything stored locally for the project.
    pub async fn delete_project(&self, project_id: &str) -> HistoryResult<()> {
        let backend = self.queue.backend();
        backend.clear_cached_history_id(project_id).await?;
        self.queue.destroy(project_id).await?;
        self.resync.clear_resync_state(project_id).await?;
        self.ledger.clear_error(project_id).await
    }

    /// Creates a history in the chunk store.
    pub async fn initialize_project(&self, history_id: Option<&str>) -> HistoryResult<HistoryId> {
        self.chunk_store.initialize_project(history_id).await
    }
}

fn already_seen_project_version(previous: Option<&Version>, edit: &RawEdit) -> bool {
    match (previous, &edit.version) {
        (Some(previous), Some(version)) => edit.is_project_structure() && previous.gte(version),
        _ => false,
    }
}

fn already_seen_doc_version<'a>(
    previous: impl Fn(&str) -> Option<&'a Version>,
    edit: &RawEdit,
) -> bool {
    if !edit.is_text() {
        return false;
    }
    match (edit.doc_id(), edit.doc_version()) {
        (Some(doc), Some(version)) => previous(doc).is_some_and(|previous| previous.gte(version)),
        _ => false,
    }
}

/// Fails when structure or doc versions do not increase within the batch.
fn check_incoming_order(project_id: &str, edits: &[RawEdit]) -> HistoryResult<()> {
    let mut incoming_project_version: Option<Version> = None;
    let mut incoming_doc_versions: BTreeMap<&str, Version> = BTreeMap::new();
    for edit in edits {
        if already_seen_project_version(incoming_project_version.as_ref(), edit) {
            warn!(project_id, "incoming project structure updates are out of order");
            return Err(HistoryError::OpsOutOfOrder(
                "project structure version out of order on incoming updates".to_string(),
            ));
        }
        if already_seen_doc_version(|doc| incoming_doc_versions.get(doc), edit) {
            warn!(project_id, "incoming doc updates are out of order");
            return Err(HistoryError::OpsOutOfOrder(
                "doc version out of order on incoming updates".to_string(),
            ));
        }
        if edit.is_project_structure() {
            incoming_project_version = edit.version.clone();
        } else if edit.is_text() {
            let Some(doc) = edit.doc_id() else {
                continue;
            };
            match edit.doc_version() {
                Some(version) => {
                    incoming_doc_versions.insert(doc, version.clone());
                }
                None => {
                    incoming_doc_versions.remove(doc);
                }
            }
        }
    }
    Ok(())
}

/// Drops edits the baseline already covers. The batch must itself be in
/// order: a structure or doc version that does not increase within the batch
/// is an error, never silently dropped.
pub fn skip_already_applied_updates(
    project_id: &str,
    edits: Vec<RawEdit>,
    baseline: &Baseline,
) -> HistoryResult<Vec<RawEdit>> {
    check_incoming_order(project_id, &edits)?;

    let previous_project_version = baseline.project_version.as_ref();
    let mut kept = Vec::with_capacity(edits.len());
    for edit in edits {
        if already_seen_project_version(previous_project_version, &edit) {
            debug!(project_id, "discarding previously applied project structure update");
            continue;
        }
        if already_seen_doc_version(
            |doc| baseline.doc_versions.get(doc).map(|entry| &entry.v),
            &edit,
        ) {
            debug!(project_id, "discarding previously applied doc update");
            continue;
        }
        kept.push(edit);
    }
    Ok(kept)
}

fn log_change_telemetry(project_id: &str, changes: &[Change]) -> HistoryResult<()> {
    let byte_length = serde_json::to_vec(changes)?.len();
    let operations: usize = changes.iter().map(|change| change.operations.len()).sum();
    debug!(
        project_id,
        changes = changes.len(),
        operations,
        bytes = byte_length,
        "sending changes"
    );
    if changes.len() > MAX_CHANGES_PER_REQUEST {
        warn!(project_id, changes = changes.len(), "change count exceeds limit");
    }
    if byte_length > MAX_CHANGE_BYTES {
        let change_lengths = changes
            .iter()
            .map(|change| serde_json::to_vec(change).map(|bytes| bytes.len()))
            .collect::<Result<Vec<_>, _>>()?;
        warn!(project_id, byte_length, ?change_lengths, "change size exceeds limit");
    }
    Ok(())
}
