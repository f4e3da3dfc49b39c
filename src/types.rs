//! Shared identifiers and small value types.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Project identifier in the metadata service.
pub type ProjectId = String;
/// Identifier of a project's history in the chunk store.
pub type HistoryId = String;
/// Document identifier.
pub type DocId = String;
/// Binary file identifier.
pub type FileId = String;
/// Milliseconds since the Unix epoch.
pub type TimestampMs = i64;

/// Where a change came from (`{"kind": "history-resync"}` and friends).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Origin {
    /// Origin kind, e.g. `history-resync` or an external source name.
    pub kind: String,
    /// Any extra fields the producer attached.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Origin {
    /// Origin with only a kind.
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            extra: Map::new(),
        }
    }
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as TimestampMs)
        .unwrap_or(0)
}
