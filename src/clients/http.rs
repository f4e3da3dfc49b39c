//! reqwest implementations of the client traits.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    change::Change,
    chunk::ChunkResponse,
    config::EndpointConfig,
    error::{HistoryError, HistoryResult},
    resync::ResyncOptions,
    types::HistoryId,
};

use super::{ChunkStoreClient, FileStoreClient, MetadataClient, SendChangesOutcome};

const CHUNK_STORE: &str = "history store";
const METADATA: &str = "metadata service";
const FILESTORE: &str = "filestore";

fn build_client(config: &EndpointConfig) -> HistoryResult<Client> {
    Client::builder()
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| HistoryError::Config(format!("http client: {e}")))
}

fn ensure_success(service: &'static str, url: &str, response: Response) -> HistoryResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(HistoryError::HttpStatus {
            service,
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

/// Chunk store over HTTP with basic auth.
#[derive(Debug, Clone)]
pub struct HttpChunkStore {
    client: Client,
    base_url: String,
    user: String,
    password: String,
}

impl HttpChunkStore {
    /// Builds the client with basic auth credentials from `config`.
    pub fn new(config: &EndpointConfig) -> HistoryResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.chunk_store_url.trim_end_matches('/').to_string(),
            user: config.chunk_store_user.clone(),
            password: config.chunk_store_password.clone(),
        })
    }

    fn project_url(&self, history_id: &str, rest: &str) -> String {
        format!("{}/projects/{history_id}/{rest}", self.base_url)
    }

    async fn get_chunk(&self, url: String) -> HistoryResult<ChunkResponse> {
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        ensure_success(CHUNK_STORE, &url, response)?
            .json::<ChunkResponse>()
            .await
            .map_err(|e| HistoryError::request(&url, e))
    }
}

#[async_trait]
impl ChunkStoreClient for HttpChunkStore {
    async fn latest_chunk(&self, history_id: &str) -> HistoryResult<ChunkResponse> {
        self.get_chunk(self.project_url(history_id, "latest/history"))
            .await
    }

    async fn chunk_at_version(
        &self,
        history_id: &str,
        version: u64,
    ) -> HistoryResult<ChunkResponse> {
        self.get_chunk(self.project_url(history_id, &format!("versions/{version}/history")))
            .await
    }

    async fn send_changes(
        &self,
        history_id: &str,
        changes: &[Change],
        end_version: u64,
    ) -> HistoryResult<SendChangesOutcome> {
        let url = self.project_url(
            history_id,
            &format!("legacy_changes?end_version={end_version}&return_snapshot=none"),
        );
        debug!(history_id, changes = changes.len(), end_version, "sending changes");
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(changes)
            .send()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        let body = ensure_success(CHUNK_STORE, &url, response)?
            .bytes()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        if body.is_empty() {
            return Ok(SendChangesOutcome::default());
        }
        Ok(serde_json::from_slice(&body).unwrap_or_default())
    }

    async fn blob_exists(&self, history_id: &str, hash: &str) -> HistoryResult<bool> {
        let url = self.project_url(history_id, &format!("blobs/{hash}"));
        let response = self
            .client
            .head(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(CHUNK_STORE, &url, response)?;
        Ok(true)
    }

    async fn put_blob(&self, history_id: &str, hash: &str, content: Vec<u8>) -> HistoryResult<()> {
        let url = self.project_url(history_id, &format!("blobs/{hash}"));
        let response = self
            .client
            .put(&url)
            .basic_auth(&self.user, Some(&self.password))
            .body(content)
            .send()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        ensure_success(CHUNK_STORE, &url, response)?;
        Ok(())
    }

    async fn get_blob(&self, history_id: &str, hash: &str) -> HistoryResult<Vec<u8>> {
        let url = self.project_url(history_id, &format!("blobs/{hash}"));
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        let bytes = ensure_success(CHUNK_STORE, &url, response)?
            .bytes()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        Ok(bytes.to_vec())
    }

    async fn initialize_project(&self, history_id: Option<&str>) -> HistoryResult<HistoryId> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Created {
            project_id: Value,
        }

        let url = format!("{}/projects", self.base_url);
        let body = match history_id {
            Some(id) => json!({ "projectId": id }),
            None => json!({}),
        };
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        let created: Created = ensure_success(CHUNK_STORE, &url, response)?
            .json()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        id_from_value(&created.project_id).ok_or_else(|| {
            HistoryError::UnexpectedResponse("project created without an id".to_string())
        })
    }

    async fn delete_project(&self, history_id: &str) -> HistoryResult<()> {
        let url = format!("{}/projects/{history_id}", self.base_url);
        let response = self
            .client
            .delete(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        ensure_success(CHUNK_STORE, &url, response)?;
        Ok(())
    }
}

/// Metadata service over HTTP.
#[derive(Debug, Clone)]
pub struct HttpMetadataClient {
    client: Client,
    base_url: String,
}

impl HttpMetadataClient {
    /// Builds the client.
    pub fn new(config: &EndpointConfig) -> HistoryResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.metadata_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MetadataClient for HttpMetadataClient {
    async fn get_history_id(&self, project_id: &str) -> HistoryResult<Option<HistoryId>> {
        let url = format!("{}/project/{project_id}/details", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        let details: Value = ensure_success(METADATA, &url, response)?
            .json()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        Ok(details
            .pointer("/overleaf/history/id")
            .and_then(id_from_value))
    }

    async fn request_resync(
        &self,
        project_id: &str,
        options: &ResyncOptions,
    ) -> HistoryResult<()> {
        let url = format!("{}/project/{project_id}/history/resync", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(options)
            .send()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        ensure_success(METADATA, &url, response)?;
        Ok(())
    }
}

/// Legacy file store over HTTP. Incoming URLs are validated and re-rooted
/// at the configured base URL.
#[derive(Debug, Clone)]
pub struct HttpFileStore {
    client: Client,
    base_url: String,
}

impl HttpFileStore {
    /// Builds the client against `config.filestore_url`.
    pub fn new(config: &EndpointConfig) -> HistoryResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.filestore_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FileStoreClient for HttpFileStore {
    async fn fetch(&self, url: &str) -> HistoryResult<Option<Vec<u8>>> {
        let url = filestore_url(&self.base_url, url)?;
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = ensure_success(FILESTORE, &url, response)?
            .bytes()
            .await
            .map_err(|e| HistoryError::request(&url, e))?;
        Ok(Some(bytes.to_vec()))
    }
}

/// Rewrites a producer-supplied file URL onto `base`, keeping only the
/// `project/{id}/file/{id}` part of its path.
pub fn filestore_url(base: &str, url: &str) -> HistoryResult<String> {
    let parsed = Url::parse(url).map_err(|_| HistoryError::InvalidFileUrl(url.to_string()))?;
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|segments| segments.collect())
        .unwrap_or_default();
    segments
        .windows(4)
        .find(|w| w[0] == "project" && w[2] == "file" && !w[1].is_empty() && !w[3].is_empty())
        .map(|w| format!("{}/project/{}/file/{}", base.trim_end_matches('/'), w[1], w[3]))
        .ok_or_else(|| HistoryError::InvalidFileUrl(url.to_string()))
}

fn id_from_value(value: &Value) -> Option<HistoryId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::filestore_url;

    #[test]
    fn file_urls_are_rerooted() {
        let url = filestore_url(
            "http://filestore:3009/",
            "http://elsewhere.example.com/project/p1/file/f1?x=1",
        )
        .expect("valid");
        assert_eq!(url, "http://filestore:3009/project/p1/file/f1");
    }

    #[test]
    fn malformed_file_urls_are_rejected() {
        assert!(filestore_url("http://fs", "filestore.example.com/test.png").is_err());
        assert!(filestore_url("http://fs", "http://fs/project/p1/blob/f1").is_err());
    }
}
