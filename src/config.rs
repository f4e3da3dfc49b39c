//! Tunables for every component, with production defaults and TOML loading.
//!
//! Each component takes its own section by value in its constructor, so tests
//! can shrink timeouts or caps per case.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, HistoryResult};

/// Top-level configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Distributed lock timings.
    #[serde(default)]
    pub lock: LockConfig,
    /// Queue batch caps.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Compression limits.
    #[serde(default)]
    pub compressor: CompressorConfig,
    /// Blob upload concurrency and retry.
    #[serde(default)]
    pub blobs: BlobConfig,
    /// Retry sweep limits.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Old-ops flush sweep limits.
    #[serde(default)]
    pub flush: FlushConfig,
    /// External service endpoints.
    #[serde(default)]
    pub endpoints: EndpointConfig,
    /// Local state storage.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Log level hint for the embedding process.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Lock lease timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease time-to-live.
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,
    /// Delay between acquisition attempts.
    #[serde(default = "default_lock_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Give up acquiring after this long.
    #[serde(default = "default_lock_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Extensions requested sooner than this after the last one are skipped.
    #[serde(default = "default_lock_min_extension_interval_ms")]
    pub min_extension_interval_ms: u64,
}

/// Queue read caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum raw items read per batch.
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,
    /// Maximum total serialized bytes per batch.
    #[serde(default = "default_raw_update_size_threshold")]
    pub raw_update_size_threshold: usize,
    /// Maximum total text ops per batch.
    #[serde(default = "default_max_update_op_length")]
    pub max_update_op_length: usize,
    /// Maximum whole-document resync snapshots per batch.
    #[serde(default = "default_max_new_doc_content_count")]
    pub max_new_doc_content_count: usize,
    /// Time-to-live for the cached history id.
    #[serde(default = "default_history_id_cache_ttl_ms")]
    pub history_id_cache_ttl_ms: u64,
}

/// Compression limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressorConfig {
    /// Edits further apart than this are never merged.
    #[serde(default = "default_max_time_between_updates_ms")]
    pub max_time_between_updates_ms: u64,
    /// Merges producing a single op at least this many chars are refused.
    #[serde(default = "default_max_update_size")]
    pub max_update_size: usize,
    /// Time budget for one character diff.
    #[serde(default = "default_diff_timeout_ms")]
    pub diff_timeout_ms: u64,
}

/// Blob creation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Concurrent blob creations per batch.
    #[serde(default = "default_blob_concurrency")]
    pub concurrency: usize,
    /// Attempts per blob.
    #[serde(default = "default_blob_attempts")]
    pub attempts: u32,
    /// Delay between attempts.
    #[serde(default = "default_blob_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

/// Retry sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Default number of projects per sweep.
    #[serde(default = "default_retry_limit")]
    pub limit: usize,
    /// Default wall-clock budget for one sweep.
    #[serde(default = "default_retry_timeout_ms")]
    pub timeout_ms: u64,
    /// How long a hard retry waits for the queue to drain.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Poll interval while waiting for the queue to drain.
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,
}

/// Old-ops flush settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    /// Only flush projects whose oldest queued op is older than this.
    #[serde(default = "default_flush_max_age_ms")]
    pub max_age_ms: u64,
    /// Maximum projects flushed per sweep.
    #[serde(default = "default_flush_limit")]
    pub limit: usize,
    /// Wall-clock budget for one sweep.
    #[serde(default = "default_flush_timeout_ms")]
    pub timeout_ms: u64,
    /// Projects flushed concurrently.
    #[serde(default = "default_flush_concurrency")]
    pub concurrency: usize,
}

/// External service endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Chunk store base URL.
    #[serde(default = "default_chunk_store_url")]
    pub chunk_store_url: String,
    /// Chunk store basic-auth user.
    #[serde(default = "default_chunk_store_user")]
    pub chunk_store_user: String,
    /// Chunk store basic-auth password.
    #[serde(default)]
    pub chunk_store_password: String,
    /// Metadata service base URL.
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
    /// Legacy file store base URL.
    #[serde(default = "default_filestore_url")]
    pub filestore_url: String,
    /// Per-request timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Local SQLite state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the SQLite database file.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

/// Log level passed to whichever subscriber the host installs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Config {
    /// Parses a TOML document; absent keys take their defaults.
    pub fn from_toml_str(content: &str) -> HistoryResult<Self> {
        toml::from_str(content).map_err(|e| HistoryError::Config(e.to_string()))
    }

    /// Reads a TOML file and applies `PROJECT_HISTORY_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> HistoryResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| HistoryError::Config(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Endpoint credentials are usually injected through the environment.
    pub fn apply_env_overrides(&mut self) {
        let overrides: [(&str, &mut String); 5] = [
            ("PROJECT_HISTORY_CHUNK_STORE_URL", &mut self.endpoints.chunk_store_url),
            ("PROJECT_HISTORY_CHUNK_STORE_USER", &mut self.endpoints.chunk_store_user),
            (
                "PROJECT_HISTORY_CHUNK_STORE_PASSWORD",
                &mut self.endpoints.chunk_store_password,
            ),
            ("PROJECT_HISTORY_METADATA_URL", &mut self.endpoints.metadata_url),
            ("PROJECT_HISTORY_FILESTORE_URL", &mut self.endpoints.filestore_url),
        ];
        for (key, slot) in overrides {
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    *slot = value;
                }
            }
        }
        if let Ok(level) = std::env::var("PROJECT_HISTORY_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }
}

impl LockConfig {
    /// Lease time-to-live.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Delay between acquisition attempts.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Acquisition ceiling.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Minimum spacing between real extensions.
    pub fn min_extension_interval(&self) -> Duration {
        Duration::from_millis(self.min_extension_interval_ms)
    }
}

impl QueueConfig {
    /// Time-to-live for the cached history id.
    pub fn history_id_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.history_id_cache_ttl_ms)
    }
}

impl CompressorConfig {
    /// Diff time budget.
    pub fn diff_timeout(&self) -> Duration {
        Duration::from_millis(self.diff_timeout_ms)
    }
}

impl BlobConfig {
    /// Delay between attempts.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl RetryConfig {
    /// Default sweep budget.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Queue drain ceiling for hard retries.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Queue drain poll interval.
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}

impl FlushConfig {
    /// Minimum age of the oldest queued op.
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    /// Sweep budget.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl EndpointConfig {
    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lock_ttl_ms(),
            poll_interval_ms: default_lock_poll_interval_ms(),
            max_wait_ms: default_lock_max_wait_ms(),
            min_extension_interval_ms: default_lock_min_extension_interval_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            read_batch_size: default_read_batch_size(),
            raw_update_size_threshold: default_raw_update_size_threshold(),
            max_update_op_length: default_max_update_op_length(),
            max_new_doc_content_count: default_max_new_doc_content_count(),
            history_id_cache_ttl_ms: default_history_id_cache_ttl_ms(),
        }
    }
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            max_time_between_updates_ms: default_max_time_between_updates_ms(),
            max_update_size: default_max_update_size(),
            diff_timeout_ms: default_diff_timeout_ms(),
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            concurrency: default_blob_concurrency(),
            attempts: default_blob_attempts(),
            retry_interval_ms: default_blob_retry_interval_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            limit: default_retry_limit(),
            timeout_ms: default_retry_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_age_ms: default_flush_max_age_ms(),
            limit: default_flush_limit(),
            timeout_ms: default_flush_timeout_ms(),
            concurrency: default_flush_concurrency(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            chunk_store_url: default_chunk_store_url(),
            chunk_store_user: default_chunk_store_user(),
            chunk_store_password: String::new(),
            metadata_url: default_metadata_url(),
            filestore_url: default_filestore_url(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_lock_ttl_ms() -> u64 {
    360_000
}
fn default_lock_poll_interval_ms() -> u64 {
    50
}
fn default_lock_max_wait_ms() -> u64 {
    10_000
}
fn default_lock_min_extension_interval_ms() -> u64 {
    1_000
}
fn default_read_batch_size() -> usize {
    500
}
fn default_raw_update_size_threshold() -> usize {
    4 * 1024 * 1024
}
fn default_max_update_op_length() -> usize {
    1024
}
fn default_max_new_doc_content_count() -> usize {
    32
}
fn default_history_id_cache_ttl_ms() -> u64 {
    300_000
}
fn default_max_time_between_updates_ms() -> u64 {
    60_000
}
fn default_max_update_size() -> usize {
    2 * 1024 * 1024
}
fn default_diff_timeout_ms() -> u64 {
    100
}
fn default_blob_concurrency() -> usize {
    4
}
fn default_blob_attempts() -> u32 {
    3
}
fn default_blob_retry_interval_ms() -> u64 {
    1_000
}
fn default_retry_limit() -> usize {
    100
}
fn default_retry_timeout_ms() -> u64 {
    5 * 60 * 1000
}
fn default_drain_timeout_ms() -> u64 {
    30_000
}
fn default_drain_poll_interval_ms() -> u64 {
    1_000
}
fn default_flush_max_age_ms() -> u64 {
    6 * 3600 * 1000
}
fn default_flush_limit() -> usize {
    1_000
}
fn default_flush_timeout_ms() -> u64 {
    5 * 60 * 1000
}
fn default_flush_concurrency() -> usize {
    4
}
fn default_chunk_store_url() -> String {
    "http://127.0.0.1:3100/api".to_string()
}
fn default_chunk_store_user() -> String {
    "staging".to_string()
}
fn default_metadata_url() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_filestore_url() -> String {
    "http://127.0.0.1:3009".to_string()
}
fn default_request_timeout_ms() -> u64 {
    60_000
}
fn default_sqlite_path() -> String {
    "project-history.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
