//! External HTTP collaborators behind small async traits.
//!
//! The pipeline only ever talks to these traits; [`http`] has the reqwest
//! implementations and tests inject fakes.

/// reqwest clients for the chunk store, metadata service and file store.
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    change::Change,
    chunk::ChunkResponse,
    error::HistoryResult,
    resync::ResyncOptions,
    types::HistoryId,
};

/// Result of appending a change batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendChangesOutcome {
    /// The store detected drift and asks for a structure resync.
    #[serde(default)]
    pub resync_needed: bool,
}

/// Append-only chunk store holding committed history and blobs.
#[async_trait]
pub trait ChunkStoreClient: Send + Sync {
    /// Most recent chunk.
    async fn latest_chunk(&self, history_id: &str) -> HistoryResult<ChunkResponse>;

    /// Chunk containing `version`.
    async fn chunk_at_version(&self, history_id: &str, version: u64)
    -> HistoryResult<ChunkResponse>;

    /// Appends `changes` so they start at `end_version`. The store rejects a
    /// non-contiguous append.
    async fn send_changes(
        &self,
        history_id: &str,
        changes: &[Change],
        end_version: u64,
    ) -> HistoryResult<SendChangesOutcome>;

    /// Whether a blob with `hash` is already stored.
    async fn blob_exists(&self, history_id: &str, hash: &str) -> HistoryResult<bool>;

    /// Stores `content` under `hash`.
    async fn put_blob(&self, history_id: &str, hash: &str, content: Vec<u8>) -> HistoryResult<()>;

    /// Blob bytes.
    async fn get_blob(&self, history_id: &str, hash: &str) -> HistoryResult<Vec<u8>>;

    /// Creates a history, optionally with a caller-chosen id.
    async fn initialize_project(&self, history_id: Option<&str>) -> HistoryResult<HistoryId>;

    /// Deletes a history and its blobs.
    async fn delete_project(&self, history_id: &str) -> HistoryResult<()>;
}

/// Authoritative project metadata.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// History id of the project, `None` when it has no history.
    async fn get_history_id(&self, project_id: &str) -> HistoryResult<Option<HistoryId>>;

    /// Asks the metadata service to queue a structure resync edit (and doc
    /// content resync edits unless `structure_only`).
    async fn request_resync(&self, project_id: &str, options: &ResyncOptions)
    -> HistoryResult<()>;
}

/// Legacy file store for binary content referenced by URL.
#[async_trait]
pub trait FileStoreClient: Send + Sync {
    /// File bytes, or `None` when the store answers 404.
    async fn fetch(&self, url: &str) -> HistoryResult<Option<Vec<u8>>>;
}
