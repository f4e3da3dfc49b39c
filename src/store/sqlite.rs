//! SQLite backend shared by worker processes on one host.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    config::StorageConfig,
    error::{HistoryError, HistoryResult},
    ledger::FailureRecord,
    sync_state::SyncStateRecord,
    types::{HistoryId, ProjectId, TimestampMs, now_ms},
};

use super::{LockBackend, QueueBackend, StateBackend};

const RECORD_FORMAT_VERSION: u16 = 1;

/// How long a call waits on another handle's write lock before `SQLITE_BUSY`.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
struct RecordEnvelope<T> {
    format_version: u16,
    record: T,
}

/// SQLite implementation of every backend trait.
///
/// Calls run on the blocking pool; one connection is shared behind a mutex.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens or creates a store at `path`.
    ///
    /// Enables WAL mode, sets `synchronous=NORMAL` and waits up to
    /// [`BUSY_TIMEOUT`] on locks held by other handles.
    pub fn open(path: impl AsRef<Path>) -> HistoryResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens the store at `config.sqlite_path`.
    pub fn from_config(config: &StorageConfig) -> HistoryResult<Self> {
        Self::open(&config.sqlite_path)
    }

    /// Opens an in-memory SQLite store.
    pub fn open_in_memory() -> HistoryResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> HistoryResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> HistoryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> HistoryResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| HistoryError::Store("sqlite connection poisoned".to_string()))?;
            f(&mut guard)
        })
        .await?
    }
}

fn encode_record<T: Serialize>(record: &T) -> HistoryResult<Vec<u8>> {
    Ok(serde_json::to_vec(&RecordEnvelope {
        format_version: RECORD_FORMAT_VERSION,
        record,
    })?)
}

fn decode_record<T: DeserializeOwned>(payload: &[u8]) -> HistoryResult<T> {
    let envelope: RecordEnvelope<T> = serde_json::from_slice(payload)?;
    if envelope.format_version != RECORD_FORMAT_VERSION {
        return Err(HistoryError::Store(format!(
            "unsupported record format version: {}",
            envelope.format_version
        )));
    }
    Ok(envelope.record)
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms() + ttl.as_millis() as i64
}

#[async_trait]
impl LockBackend for SqliteStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> HistoryResult<bool> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM locks WHERE key = ?1 AND expires_at_ms <= ?2",
                params![key, now_ms()],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO locks(key, value, expires_at_ms) VALUES (?1, ?2, ?3)",
                params![key, value, expiry_ms(ttl)],
            )?;
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn extend_if_equal(&self, key: &str, value: &str, ttl: Duration) -> HistoryResult<bool> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE locks SET expires_at_ms = ?3
                 WHERE key = ?1 AND value = ?2 AND expires_at_ms > ?4",
                params![key, value, expiry_ms(ttl), now_ms()],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    async fn delete_if_equal(&self, key: &str, value: &str) -> HistoryResult<bool> {
        let (key, value) = (key.to_string(), value.to_string());
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM locks WHERE key = ?1 AND value = ?2 AND expires_at_ms > ?3",
                params![key, value, now_ms()],
            )?;
            Ok(deleted == 1)
        })
        .await
    }
}

#[async_trait]
impl QueueBackend for SqliteStore {
    async fn range(&self, project_id: &str, count: usize) -> HistoryResult<Vec<String>> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM queue WHERE project_id = ?1 ORDER BY id ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![project_id, count as i64], |row| row.get(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn remove_one(&self, project_id: &str, raw: &str) -> HistoryResult<bool> {
        let (project_id, raw) = (project_id.to_string(), raw.to_string());
        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM queue WHERE id = (
                    SELECT id FROM queue WHERE project_id = ?1 AND payload = ?2
                    ORDER BY id ASC LIMIT 1
                 )",
                params![project_id, raw],
            )?;
            Ok(deleted == 1)
        })
        .await
    }

    async fn len(&self, project_id: &str) -> HistoryResult<usize> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM queue WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn push(&self, project_id: &str, raws: &[String]) -> HistoryResult<()> {
        if raws.is_empty() {
            return Ok(());
        }
        let (project_id, raws) = (project_id.to_string(), raws.to_vec());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt =
                    tx.prepare("INSERT INTO queue(project_id, payload) VALUES (?1, ?2)")?;
                for raw in &raws {
                    stmt.execute(params![project_id, raw])?;
                }
            }
            tx.execute(
                "INSERT OR IGNORE INTO first_op_timestamps(project_id, ts_ms) VALUES (?1, ?2)",
                params![project_id, now_ms()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn destroy(&self, project_id: &str) -> HistoryResult<()> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM queue WHERE project_id = ?1", params![project_id])?;
            Ok(())
        })
        .await
    }

    async fn first_op_timestamp(&self, project_id: &str) -> HistoryResult<Option<TimestampMs>> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT ts_ms FROM first_op_timestamps WHERE project_id = ?1",
                    params![project_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn set_first_op_timestamp_if_absent(
        &self,
        project_id: &str,
        ts: TimestampMs,
    ) -> HistoryResult<()> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO first_op_timestamps(project_id, ts_ms) VALUES (?1, ?2)",
                params![project_id, ts],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear_first_op_timestamp(&self, project_id: &str) -> HistoryResult<()> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM first_op_timestamps WHERE project_id = ?1",
                params![project_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn projects_with_first_op_timestamp(
        &self,
    ) -> HistoryResult<Vec<(ProjectId, TimestampMs)>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT project_id, ts_ms FROM first_op_timestamps ORDER BY ts_ms ASC")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn projects_with_queued_edits(&self) -> HistoryResult<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT project_id) FROM queue",
                [],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn cached_history_id(&self, project_id: &str) -> HistoryResult<Option<HistoryId>> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT history_id FROM history_ids
                     WHERE project_id = ?1 AND expires_at_ms > ?2",
                    params![project_id, now_ms()],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn cache_history_id(
        &self,
        project_id: &str,
        history_id: &str,
        ttl: Duration,
    ) -> HistoryResult<()> {
        let (project_id, history_id) = (project_id.to_string(), history_id.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO history_ids(project_id, history_id, expires_at_ms)
                 VALUES (?1, ?2, ?3)",
                params![project_id, history_id, expiry_ms(ttl)],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear_cached_history_id(&self, project_id: &str) -> HistoryResult<()> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM history_ids WHERE project_id = ?1", params![project_id])?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl StateBackend for SqliteStore {
    async fn failure(&self, project_id: &str) -> HistoryResult<Option<FailureRecord>> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            let payload: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT payload FROM failures WHERE project_id = ?1",
                    params![project_id],
                    |row| row.get(0),
                )
                .optional()?;
            payload.as_deref().map(decode_record).transpose()
        })
        .await
    }

    async fn put_failure(&self, record: &FailureRecord) -> HistoryResult<()> {
        let project_id = record.project_id.clone();
        let payload = encode_record(record)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO failures(project_id, ts_ms, payload) VALUES (?1, ?2, ?3)",
                params![project_id, now_ms(), payload],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_failure(&self, project_id: &str) -> HistoryResult<()> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM failures WHERE project_id = ?1", params![project_id])?;
            Ok(())
        })
        .await
    }

    async fn failures(&self) -> HistoryResult<Vec<FailureRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT payload FROM failures ORDER BY project_id ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(decode_record(&row?)?);
            }
            Ok(out)
        })
        .await
    }

    async fn sync_state(&self, project_id: &str) -> HistoryResult<Option<SyncStateRecord>> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            let payload: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT payload FROM sync_states
                     WHERE project_id = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
                    params![project_id, Utc::now().timestamp_millis()],
                    |row| row.get(0),
                )
                .optional()?;
            payload.as_deref().map(decode_record).transpose()
        })
        .await
    }

    async fn put_sync_state(&self, record: &SyncStateRecord) -> HistoryResult<()> {
        let project_id = record.project_id.clone();
        let expires_at_ms = record.expires_at.map(|at| at.timestamp_millis());
        let payload = encode_record(record)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sync_states(project_id, expires_at_ms, payload)
                 VALUES (?1, ?2, ?3)",
                params![project_id, expires_at_ms, payload],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_sync_state(&self, project_id: &str) -> HistoryResult<()> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM sync_states WHERE project_id = ?1", params![project_id])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::{BUSY_TIMEOUT, SqliteStore};

    #[test]
    fn connections_wait_on_busy_locks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(dir.path().join("busy.db")).expect("open");
        let conn = store.conn.lock().expect("lock");
        let timeout: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .expect("pragma");
        assert_eq!(timeout, BUSY_TIMEOUT.as_millis() as i64);
    }
}
