#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use project_history::{
    change::Change,
    chunk::{ChunkResponse, RawChunk, RawHistory, RawSnapshot},
    clients::{ChunkStoreClient, FileStoreClient, MetadataClient, SendChangesOutcome},
    config::Config,
    error::{HistoryError, HistoryResult},
    pipeline::{Collaborators, IngestionPipeline},
    resync::ResyncOptions,
    store::{QueueBackend, memory::MemoryStore},
    types::HistoryId,
    update::RawEdit,
};

pub const PROJECT: &str = "project-1";
pub const HISTORY: &str = "history-1";

#[derive(Debug, Clone, Default)]
pub struct HistoryLog {
    pub start_version: u64,
    pub snapshot: RawSnapshot,
    pub changes: Vec<Change>,
}

#[derive(Default)]
pub struct ChunkState {
    pub histories: HashMap<String, HistoryLog>,
    pub blobs: HashMap<String, Vec<u8>>,
    pub blob_puts: usize,
    pub send_calls: usize,
    pub resync_needed: bool,
    pub next_id: u64,
}

/// Chunk store keeping every history in memory. Appends must start exactly
/// at the current end version.
#[derive(Default)]
pub struct FakeChunkStore {
    pub state: Mutex<ChunkState>,
}

impl FakeChunkStore {
    pub fn with_history(history_id: &str) -> Self {
        let store = Self::default();
        store.set_history(history_id, HistoryLog::default());
        store
    }

    pub fn set_history(&self, history_id: &str, log: HistoryLog) {
        self.state
            .lock()
            .expect("chunk state")
            .histories
            .insert(history_id.to_string(), log);
    }

    pub fn changes(&self, history_id: &str) -> Vec<Change> {
        self.state
            .lock()
            .expect("chunk state")
            .histories
            .get(history_id)
            .map(|log| log.changes.clone())
            .unwrap_or_default()
    }

    pub fn changes_json(&self, history_id: &str) -> Vec<Value> {
        self.changes(history_id)
            .iter()
            .map(|change| serde_json::to_value(change).expect("change json"))
            .collect()
    }

    pub fn blob_puts(&self) -> usize {
        self.state.lock().expect("chunk state").blob_puts
    }

    pub fn send_calls(&self) -> usize {
        self.state.lock().expect("chunk state").send_calls
    }

    pub fn put_blob_content(&self, hash: &str, content: &[u8]) {
        self.state
            .lock()
            .expect("chunk state")
            .blobs
            .insert(hash.to_string(), content.to_vec());
    }

    pub fn request_resync_on_commit(&self) {
        self.state.lock().expect("chunk state").resync_needed = true;
    }
}

fn status(status: u16, url: String) -> HistoryError {
    HistoryError::HttpStatus {
        service: "chunk store",
        status,
        url,
    }
}

#[async_trait]
impl ChunkStoreClient for FakeChunkStore {
    async fn latest_chunk(&self, history_id: &str) -> HistoryResult<ChunkResponse> {
        let state = self.state.lock().expect("chunk state");
        let log = state
            .histories
            .get(history_id)
            .ok_or_else(|| status(404, format!("/projects/{history_id}/latest/history")))?;
        Ok(ChunkResponse {
            chunk: RawChunk {
                start_version: Some(log.start_version),
                history: RawHistory {
                    snapshot: log.snapshot.clone(),
                    changes: log.changes.clone(),
                },
            },
        })
    }

    async fn chunk_at_version(
        &self,
        history_id: &str,
        _version: u64,
    ) -> HistoryResult<ChunkResponse> {
        self.latest_chunk(history_id).await
    }

    async fn send_changes(
        &self,
        history_id: &str,
        changes: &[Change],
        end_version: u64,
    ) -> HistoryResult<SendChangesOutcome> {
        let mut state = self.state.lock().expect("chunk state");
        state.send_calls += 1;
        let resync_needed = state.resync_needed;
        let url = format!("/projects/{history_id}/legacy_changes?end_version={end_version}");
        let log = state
            .histories
            .get_mut(history_id)
            .ok_or_else(|| status(404, url.clone()))?;
        if log.start_version + log.changes.len() as u64 != end_version {
            return Err(status(409, url));
        }
        log.changes.extend(changes.iter().cloned());
        Ok(SendChangesOutcome { resync_needed })
    }

    async fn blob_exists(&self, _history_id: &str, hash: &str) -> HistoryResult<bool> {
        Ok(self.state.lock().expect("chunk state").blobs.contains_key(hash))
    }

    async fn put_blob(&self, _history_id: &str, hash: &str, content: Vec<u8>) -> HistoryResult<()> {
        let mut state = self.state.lock().expect("chunk state");
        state.blob_puts += 1;
        state.blobs.insert(hash.to_string(), content);
        Ok(())
    }

    async fn get_blob(&self, history_id: &str, hash: &str) -> HistoryResult<Vec<u8>> {
        self.state
            .lock()
            .expect("chunk state")
            .blobs
            .get(hash)
            .cloned()
            .ok_or_else(|| status(404, format!("/projects/{history_id}/blobs/{hash}")))
    }

    async fn initialize_project(&self, history_id: Option<&str>) -> HistoryResult<HistoryId> {
        let mut state = self.state.lock().expect("chunk state");
        let id = match history_id {
            Some(id) => id.to_string(),
            None => {
                state.next_id += 1;
                format!("generated-{}", state.next_id)
            }
        };
        state.histories.insert(id.clone(), HistoryLog::default());
        Ok(id)
    }

    async fn delete_project(&self, history_id: &str) -> HistoryResult<()> {
        self.state
            .lock()
            .expect("chunk state")
            .histories
            .remove(history_id);
        Ok(())
    }
}

/// Metadata service with a fixed project to history id mapping that records
/// resync requests.
#[derive(Default)]
pub struct FakeMetadata {
    pub history_ids: Mutex<HashMap<String, String>>,
    pub resync_requests: Mutex<Vec<(String, ResyncOptions)>>,
    pub unavailable: Mutex<bool>,
}

impl FakeMetadata {
    pub fn with_project(project_id: &str, history_id: &str) -> Self {
        let metadata = Self::default();
        metadata
            .history_ids
            .lock()
            .expect("ids")
            .insert(project_id.to_string(), history_id.to_string());
        metadata
    }

    pub fn resync_requests(&self) -> Vec<(String, ResyncOptions)> {
        self.resync_requests.lock().expect("requests").clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().expect("flag") = unavailable;
    }
}

#[async_trait]
impl MetadataClient for FakeMetadata {
    async fn get_history_id(&self, project_id: &str) -> HistoryResult<Option<HistoryId>> {
        if *self.unavailable.lock().expect("flag") {
            return Err(HistoryError::Timeout("metadata service".to_string()));
        }
        Ok(self.history_ids.lock().expect("ids").get(project_id).cloned())
    }

    async fn request_resync(&self, project_id: &str, options: &ResyncOptions) -> HistoryResult<()> {
        self.resync_requests
            .lock()
            .expect("requests")
            .push((project_id.to_string(), options.clone()));
        Ok(())
    }
}

/// File store serving fixed content by URL; anything else is a 404.
#[derive(Default)]
pub struct FakeFileStore {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub fetches: Mutex<usize>,
}

impl FakeFileStore {
    pub fn serve(&self, url: &str, content: &[u8]) {
        self.files
            .lock()
            .expect("files")
            .insert(url.to_string(), content.to_vec());
    }

    pub fn fetches(&self) -> usize {
        *self.fetches.lock().expect("fetches")
    }
}

#[async_trait]
impl FileStoreClient for FakeFileStore {
    async fn fetch(&self, url: &str) -> HistoryResult<Option<Vec<u8>>> {
        *self.fetches.lock().expect("fetches") += 1;
        Ok(self.files.lock().expect("files").get(url).cloned())
    }
}

/// Production defaults with every wait shrunk to keep tests fast.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.lock.poll_interval_ms = 5;
    config.lock.max_wait_ms = 200;
    config.lock.min_extension_interval_ms = 0;
    config.blobs.retry_interval_ms = 1;
    config.retry.drain_timeout_ms = 200;
    config.retry.drain_poll_interval_ms = 5;
    config
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub chunk_store: Arc<FakeChunkStore>,
    pub metadata: Arc<FakeMetadata>,
    pub file_store: Arc<FakeFileStore>,
    pub pipeline: IngestionPipeline,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let chunk_store = Arc::new(FakeChunkStore::with_history(HISTORY));
        let metadata = Arc::new(FakeMetadata::with_project(PROJECT, HISTORY));
        let file_store = Arc::new(FakeFileStore::default());
        let collaborators = Collaborators::from_store(
            store.clone(),
            chunk_store.clone(),
            metadata.clone(),
            file_store.clone(),
        );
        let pipeline = IngestionPipeline::new(&config, collaborators);
        Self {
            store,
            chunk_store,
            metadata,
            file_store,
            pipeline,
        }
    }

    pub async fn push(&self, edits: &[Value]) {
        let raws: Vec<String> = edits.iter().map(Value::to_string).collect();
        self.store.push(PROJECT, &raws).await.expect("push");
    }

    pub async fn queue_len(&self) -> usize {
        self.store.len(PROJECT).await.expect("len")
    }
}

pub fn text_edit(doc: &str, pathname: &str, ops: Value, v: u64, doc_length: i64, ts: i64) -> Value {
    json!({
        "doc": doc,
        "op": ops,
        "v": v,
        "meta": {
            "user_id": "user-1",
            "ts": ts,
            "pathname": pathname,
            "doc_length": doc_length,
        }
    })
}

pub fn parse(value: Value) -> RawEdit {
    serde_json::from_value(value).expect("raw edit")
}
