//! Content-addressed blob creation for add-doc and add-file edits.

use std::sync::Arc;

use futures::{StreamExt, stream};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    clients::{ChunkStoreClient, FileStoreClient},
    config::BlobConfig,
    error::{HistoryError, HistoryResult},
    hash::blob_hash,
    lock::LockLease,
    update::{EditKind, RawEdit},
};

/// Hashes of the blobs backing one structure edit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobHashes {
    /// Content blob.
    pub file: String,
    /// Ranges blob, for docs that carry tracked changes or comments.
    pub ranges: Option<String>,
}

/// An edit ready for translation.
#[derive(Debug, Clone, PartialEq)]
pub struct EditWithBlobs {
    /// The queued edit.
    pub edit: RawEdit,
    /// Set for add-doc and add-file edits.
    pub blob_hashes: Option<BlobHashes>,
}

impl EditWithBlobs {
    /// Wraps an edit that needs no blob.
    pub fn without_blobs(edit: RawEdit) -> Self {
        Self {
            edit,
            blob_hashes: None,
        }
    }
}

/// Uploads blobs to the chunk store, fetching binary content from the file
/// store when needed.
#[derive(Clone)]
pub struct BlobStore {
    chunk_store: Arc<dyn ChunkStoreClient>,
    file_store: Arc<dyn FileStoreClient>,
    config: BlobConfig,
}

impl BlobStore {
    /// Creates a blob store over the given clients.
    pub fn new(
        chunk_store: Arc<dyn ChunkStoreClient>,
        file_store: Arc<dyn FileStoreClient>,
        config: BlobConfig,
    ) -> Self {
        Self {
            chunk_store,
            file_store,
            config,
        }
    }

    /// Uploads `content` unless a blob with its hash already exists.
    pub async fn put_if_absent(&self, history_id: &str, content: Vec<u8>) -> HistoryResult<String> {
        let hash = blob_hash(&content);
        if self.chunk_store.blob_exists(history_id, &hash).await? {
            debug!(history_id, %hash, "blob already exists");
            return Ok(hash);
        }
        self.chunk_store.put_blob(history_id, &hash, content).await?;
        Ok(hash)
    }

    /// Makes sure the blobs an add-doc or add-file edit refers to exist.
    pub async fn ensure(
        &self,
        project_id: &str,
        history_id: &str,
        edit: &RawEdit,
    ) -> HistoryResult<BlobHashes> {
        match &edit.kind {
            EditKind::AddDoc {
                doc_lines, ranges, ..
            } => {
                let file = self
                    .put_if_absent(history_id, doc_lines.as_bytes().to_vec())
                    .await?;
                let ranges = match ranges {
                    Some(value) if !is_empty_ranges(value) => Some(
                        self.put_if_absent(history_id, serde_json::to_vec(value)?)
                            .await?,
                    ),
                    _ => None,
                };
                Ok(BlobHashes { file, ranges })
            }
            EditKind::AddFile {
                url,
                hash,
                created_blob,
                pathname,
                ..
            } => {
                if let Some(hash) = hash {
                    if *created_blob || self.chunk_store.blob_exists(history_id, hash).await? {
                        return Ok(BlobHashes {
                            file: hash.clone(),
                            ranges: None,
                        });
                    }
                }
                let url = url
                    .as_deref()
                    .ok_or_else(|| HistoryError::InvalidFileUrl(format!("no url for {pathname}")))?;
                let content = match self.file_store.fetch(url).await? {
                    Some(content) => content,
                    None => {
                        warn!(project_id, url, %pathname, "file not found in file store, storing empty blob");
                        Vec::new()
                    }
                };
                let file = self.put_if_absent(history_id, content).await?;
                Ok(BlobHashes { file, ranges: None })
            }
            _ => Err(HistoryError::UnknownUpdateFormat),
        }
    }

    /// Creates the blobs of every structure edit with bounded concurrency.
    ///
    /// Each creation is retried with the lease extended before every attempt.
    /// All creations run to completion before the first error is returned.
    pub async fn create_blobs_for_updates(
        &self,
        project_id: &str,
        history_id: &str,
        edits: Vec<RawEdit>,
        lease: &LockLease,
    ) -> HistoryResult<Vec<EditWithBlobs>> {
        let results: Vec<HistoryResult<EditWithBlobs>> = stream::iter(edits)
            .map(|edit| self.with_blobs(project_id, history_id, edit, lease))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;
        results.into_iter().collect()
    }

    async fn with_blobs(
        &self,
        project_id: &str,
        history_id: &str,
        edit: RawEdit,
        lease: &LockLease,
    ) -> HistoryResult<EditWithBlobs> {
        if !matches!(edit.kind, EditKind::AddDoc { .. } | EditKind::AddFile { .. }) {
            return Ok(EditWithBlobs::without_blobs(edit));
        }
        let attempts = self.config.attempts.max(1);
        let mut attempt = 1;
        loop {
            lease.extend().await?;
            match self.ensure(project_id, history_id, &edit).await {
                Ok(hashes) => {
                    return Ok(EditWithBlobs {
                        edit,
                        blob_hashes: Some(hashes),
                    });
                }
                Err(err) if attempt < attempts => {
                    warn!(project_id, attempt, error = %err, "blob creation failed, retrying");
                    attempt += 1;
                    sleep(self.config.retry_interval()).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_empty_ranges(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map
            .values()
            .all(|v| v.is_null() || v.as_array().is_some_and(Vec::is_empty)),
        _ => false,
    }
}
