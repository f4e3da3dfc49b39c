//! Resync protocol: starting a resync, skipping edits while one is under
//! way, and expanding the synthetic resync edits into concrete edits against
//! the latest snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    chunk::{RawChunk, SnapshotFile, SnapshotFiles},
    clients::{ChunkStoreClient, MetadataClient},
    diff::diff_as_text_ops,
    error::{HistoryError, HistoryResult},
    hash::blob_hash_from_str,
    ledger::FailureLedger,
    lock::{DistributedLock, LockLease, project_lock_key},
    queue::UpdateQueueReader,
    store::StateBackend,
    sync_state::{SyncState, SyncStateRecord},
    translate::normalize_pathname,
    types::{Origin, TimestampMs},
    update::{EditKind, ExpectedFile, ProjectStructure, RawEdit, UpdateMeta},
};

/// Origin stamped on changes produced by a resync nobody labelled.
pub const DEFAULT_RESYNC_ORIGIN: &str = "history-resync";

/// Options forwarded to the metadata service when requesting a resync.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncOptions {
    /// Origin recorded on the resulting changes; kept locally.
    #[serde(skip)]
    pub origin: Option<Origin>,
    /// Only reconcile structure.
    #[serde(rename = "resyncProjectStructureOnly", skip_serializing_if = "is_false")]
    pub structure_only: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Starts resyncs, tracks their state and expands resync edits.
#[derive(Clone)]
pub struct ResyncCoordinator {
    state: Arc<dyn StateBackend>,
    ledger: FailureLedger,
    metadata: Arc<dyn MetadataClient>,
    chunk_store: Arc<dyn ChunkStoreClient>,
    lock: DistributedLock,
    queue: UpdateQueueReader,
    diff_timeout: Duration,
}

impl ResyncCoordinator {
    /// Coordinator sharing the pipeline's backends, lock and queue.
    pub fn new(
        state: Arc<dyn StateBackend>,
        ledger: FailureLedger,
        metadata: Arc<dyn MetadataClient>,
        chunk_store: Arc<dyn ChunkStoreClient>,
        lock: DistributedLock,
        queue: UpdateQueueReader,
        diff_timeout: Duration,
    ) -> Self {
        Self {
            state,
            ledger,
            metadata,
            chunk_store,
            lock,
            queue,
            diff_timeout,
        }
    }

    /// Starts a resync under the project lock. Failures are recorded with a
    /// queue size of -1.
    pub async fn start_resync(&self, project_id: &str, options: &ResyncOptions) -> HistoryResult<()> {
        let result = self
            .lock
            .run_locked(&project_lock_key(project_id), |_lease| {
                self.start_resync_without_lock(project_id, options)
            })
            .await;
        self.record_start_failure(project_id, result).await
    }

    /// Drops the sync state and every queued edit, then starts a resync.
    pub async fn start_hard_resync(
        &self,
        project_id: &str,
        options: &ResyncOptions,
    ) -> HistoryResult<()> {
        let result = self
            .lock
            .run_locked(&project_lock_key(project_id), |_lease| async move {
                self.clear_resync_state(project_id).await?;
                self.queue.destroy(project_id).await?;
                self.start_resync_without_lock(project_id, options).await
            })
            .await;
        self.record_start_failure(project_id, result).await
    }

    async fn record_start_failure(
        &self,
        project_id: &str,
        result: HistoryResult<()>,
    ) -> HistoryResult<()> {
        if let Err(err) = &result {
            self.ledger.record(project_id, -1, Some(err)).await?;
        }
        result
    }

    /// Caller holds the project lock.
    pub async fn start_resync_without_lock(
        &self,
        project_id: &str,
        options: &ResyncOptions,
    ) -> HistoryResult<()> {
        self.ledger.record_sync_start(project_id).await?;

        let mut sync_state = self.get_resync_state(project_id).await?;
        if sync_state.is_sync_ongoing() {
            return Err(HistoryError::SyncOngoing);
        }
        sync_state.set_origin(
            options
                .origin
                .clone()
                .unwrap_or_else(|| Origin::kind(DEFAULT_RESYNC_ORIGIN)),
        );
        sync_state.start_project_structure_sync();

        self.metadata.request_resync(project_id, options).await?;
        info!(project_id, structure_only = options.structure_only, "resync requested");
        self.set_resync_state(project_id, Some(sync_state)).await
    }

    /// Stored sync state, or the idle default.
    pub async fn get_resync_state(&self, project_id: &str) -> HistoryResult<SyncState> {
        Ok(self
            .state
            .sync_state(project_id)
            .await?
            .map(|record| record.state)
            .unwrap_or_default())
    }

    /// Persists `sync_state`; `None` means unchanged.
    pub async fn set_resync_state(
        &self,
        project_id: &str,
        sync_state: Option<SyncState>,
    ) -> HistoryResult<()> {
        let Some(sync_state) = sync_state else {
            return Ok(());
        };
        let previous = self.state.sync_state(project_id).await?;
        let record = SyncStateRecord::next(previous, project_id, sync_state, Utc::now());
        self.state.put_sync_state(&record).await
    }

    /// Forgets the sync state.
    pub async fn clear_resync_state(&self, project_id: &str) -> HistoryResult<()> {
        self.state.delete_sync_state(project_id).await
    }

    /// Drops edits the current sync state says to skip. The returned state is
    /// `Some` only when a sync is ongoing and must be persisted after commit.
    pub async fn skip_updates_during_sync(
        &self,
        project_id: &str,
        edits: Vec<RawEdit>,
    ) -> HistoryResult<(Vec<RawEdit>, Option<SyncState>)> {
        let mut sync_state = self.get_resync_state(project_id).await?;
        if !sync_state.is_sync_ongoing() {
            debug!(project_id, "not skipping updates: no resync in progress");
            return Ok((edits, None));
        }

        let mut kept = Vec::with_capacity(edits.len());
        for edit in edits {
            sync_state.update_state(&edit)?;
            if sync_state.should_skip_update(&edit) {
                debug!(project_id, pathname = ?edit.pathname(), "skipping update due to resync");
            } else {
                kept.push(edit);
            }
        }
        Ok((kept, Some(sync_state)))
    }

    /// Replaces resync edits with the concrete edits that bring the latest
    /// snapshot in line with them. `raws` are the queued items of the batch,
    /// used to drop an aborted structure-only resync edit from the queue.
    pub async fn expand_sync_updates(
        &self,
        project_id: &str,
        history_id: &str,
        chunk: &RawChunk,
        edits: Vec<RawEdit>,
        raws: &[String],
        lease: &LockLease,
    ) -> HistoryResult<Vec<RawEdit>> {
        if !edits
            .iter()
            .any(|edit| edit.is_resync_structure() || edit.is_resync_doc_content())
        {
            debug!(project_id, "no resync updates to expand");
            return Ok(edits);
        }

        let sync_state = self.get_resync_state(project_id).await?;
        let mut expander = SyncUpdateExpander {
            project_id,
            history_id,
            files: SnapshotFiles::from_chunk(chunk)?,
            origin: sync_state.origin,
            expanded: Vec::new(),
            chunk_store: self.chunk_store.as_ref(),
            diff_timeout: self.diff_timeout,
        };

        for edit in edits {
            match expander.expand_update(&edit).await {
                Err(HistoryError::NeedFullProjectStructureResync) => {
                    self.clear_resync_state(project_id).await?;
                    self.remove_queued_edit(project_id, &edit, raws).await?;
                    return Err(HistoryError::NeedFullProjectStructureResync);
                }
                result => result?,
            }
            lease.extend().await?;
        }
        Ok(expander.expanded)
    }

    async fn remove_queued_edit(
        &self,
        project_id: &str,
        edit: &RawEdit,
        raws: &[String],
    ) -> HistoryResult<()> {
        let raw = raws
            .iter()
            .find(|raw| RawEdit::parse(raw).is_ok_and(|parsed| &parsed == edit));
        if let Some(raw) = raw {
            self.queue.delete(project_id, std::slice::from_ref(raw), false).await?;
        }
        Ok(())
    }
}

struct SyncUpdateExpander<'a> {
    project_id: &'a str,
    history_id: &'a str,
    files: SnapshotFiles,
    origin: Option<Origin>,
    expanded: Vec<RawEdit>,
    chunk_store: &'a dyn ChunkStoreClient,
    diff_timeout: Duration,
}

/// A persisted snapshot entry as seen by structure reconciliation.
struct PersistedEntry {
    path: String,
    hash: Option<String>,
}

impl SyncUpdateExpander<'_> {
    fn meta(&self, ts: Option<TimestampMs>) -> UpdateMeta {
        UpdateMeta {
            ts,
            origin: self.origin.clone(),
            resync: true,
            ..UpdateMeta::default()
        }
    }

    async fn expand_update(&mut self, edit: &RawEdit) -> HistoryResult<()> {
        match &edit.kind {
            EditKind::ResyncProjectStructure {
                structure,
                structure_only,
            } => self.expand_structure(structure, *structure_only, edit.meta.ts),
            EditKind::ResyncDocContent {
                content, path, doc, ..
            } => {
                self.expand_doc_content(doc, path, &content.content, edit.meta.ts)
                    .await
            }
            _ => {
                self.expanded.push(edit.clone());
                Ok(())
            }
        }
    }

    /// An editable snapshot file that matches an expected binary file by path
    /// (and by hash when the expected file has one) counts as binary.
    fn is_editable(path: &str, file: &SnapshotFile, expected_files: &[ExpectedFile]) -> bool {
        if !file.is_editable() {
            return false;
        }
        let stored_hash = file.stored_hash();
        !expected_files.iter().any(|expected| {
            let hash_matches = match &expected.hash {
                Some(hash) => stored_hash == Some(hash.as_str()),
                None => true,
            };
            hash_matches && normalize_pathname(&expected.path) == path
        })
    }

    fn expand_structure(
        &mut self,
        structure: &ProjectStructure,
        structure_only: bool,
        ts: Option<TimestampMs>,
    ) -> HistoryResult<()> {
        debug!(project_id = self.project_id, "expanding resyncProjectStructure update");
        let start = self.expanded.len();

        let mut persisted_text = Vec::new();
        let mut persisted_binary = Vec::new();
        for (path, file) in self.files.iter() {
            let entry = PersistedEntry {
                path: path.clone(),
                hash: file.stored_hash().map(str::to_string),
            };
            if Self::is_editable(path, file, &structure.files) {
                persisted_text.push(entry);
            } else {
                persisted_binary.push(entry);
            }
        }
        let expected_files: Vec<(String, &ExpectedFile)> = structure
            .files
            .iter()
            .map(|file| (normalize_pathname(&file.path), file))
            .collect();
        let expected_docs: Vec<(String, &str)> = structure
            .docs
            .iter()
            .map(|doc| (normalize_pathname(&doc.path), doc.doc.as_str()))
            .collect();

        let expected_file_paths: BTreeSet<&str> =
            expected_files.iter().map(|(path, _)| path.as_str()).collect();
        let expected_doc_paths: BTreeSet<&str> =
            expected_docs.iter().map(|(path, _)| path.as_str()).collect();
        let binary_paths: BTreeSet<&str> =
            persisted_binary.iter().map(|entry| entry.path.as_str()).collect();
        let text_paths: BTreeSet<&str> =
            persisted_text.iter().map(|entry| entry.path.as_str()).collect();

        // removals first, binary before text
        for entry in &persisted_binary {
            if !expected_file_paths.contains(entry.path.as_str()) {
                self.expanded.push(self.remove_edit(&entry.path, ts));
            }
        }
        for entry in &persisted_text {
            if !expected_doc_paths.contains(entry.path.as_str()) {
                self.expanded.push(self.remove_edit(&entry.path, ts));
            }
        }

        for (path, file) in &expected_files {
            if !binary_paths.contains(path.as_str()) {
                self.expanded.push(self.add_file_edit(path, file, ts));
            }
        }
        let mut added_docs = Vec::new();
        for (path, doc) in &expected_docs {
            if !text_paths.contains(path.as_str()) {
                let meta = self.meta(ts);
                self.expanded.push(RawEdit::new(
                    EditKind::AddDoc {
                        doc: doc.to_string(),
                        pathname: path.clone(),
                        doc_lines: String::new(),
                        ranges: None,
                    },
                    meta,
                ));
                added_docs.push(path.clone());
            }
        }

        for (path, file) in &expected_files {
            let Some(persisted) = persisted_binary.iter().find(|entry| &entry.path == path) else {
                continue;
            };
            if let (Some(expected_hash), Some(persisted_hash)) = (&file.hash, &persisted.hash) {
                if expected_hash != persisted_hash {
                    self.expanded.push(self.remove_edit(path, ts));
                    self.expanded.push(self.add_file_edit(path, file, ts));
                }
            }
        }

        // later doc content resyncs diff against an empty placeholder
        for path in added_docs {
            self.files.insert(path, SnapshotFile::empty_doc());
        }

        if structure_only
            && self.expanded.iter().any(|edit| {
                edit.pathname()
                    .is_some_and(|path| expected_doc_paths.contains(path))
            })
        {
            self.expanded.truncate(start);
            return Err(HistoryError::NeedFullProjectStructureResync);
        }
        Ok(())
    }

    fn remove_edit(&self, path: &str, ts: Option<TimestampMs>) -> RawEdit {
        RawEdit::new(
            EditKind::Rename {
                pathname: path.to_string(),
                new_pathname: String::new(),
                doc: None,
                file: None,
            },
            self.meta(ts),
        )
    }

    fn add_file_edit(&self, path: &str, file: &ExpectedFile, ts: Option<TimestampMs>) -> RawEdit {
        RawEdit::new(
            EditKind::AddFile {
                file: file.file.clone(),
                pathname: path.to_string(),
                url: file.url.clone(),
                hash: file.hash.clone(),
                created_blob: file.created_blob,
            },
            self.meta(ts),
        )
    }

    async fn expand_doc_content(
        &mut self,
        doc: &str,
        path: &str,
        expected: &str,
        ts: Option<TimestampMs>,
    ) -> HistoryResult<()> {
        debug!(project_id = self.project_id, path, "expanding resyncDocContent update");
        let pathname = normalize_pathname(path);
        let file = self
            .files
            .get(&pathname)
            .ok_or_else(|| HistoryError::UnknownSnapshotFile {
                path: pathname.clone(),
            })?;

        if file
            .hash()
            .is_some_and(|hash| hash == blob_hash_from_str(expected))
        {
            debug!(project_id = self.project_id, %pathname, "skipping diff because hashes match");
            return Ok(());
        }

        let persisted = file.load_content(self.history_id, self.chunk_store).await?;
        let ops = diff_as_text_ops(&persisted, expected, self.diff_timeout);
        if ops.is_empty() {
            return Ok(());
        }
        debug!(project_id = self.project_id, %pathname, diff_count = ops.len(), "doc contents differ");
        let mut meta = self.meta(ts);
        meta.pathname = Some(pathname);
        meta.doc_length = Some(persisted.chars().count() as i64);
        self.expanded.push(RawEdit::new(
            EditKind::Text {
                doc: doc.to_string(),
                op: ops,
                v: None,
            },
            meta,
        ));
        Ok(())
    }
}
