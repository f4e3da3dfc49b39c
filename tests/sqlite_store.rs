use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::tempdir;

use project_history::{
    config::{LockConfig, StorageConfig},
    error::HistoryError,
    ledger::{FailureKind, FailureLedger},
    lock::{DistributedLock, project_lock_key},
    store::{QueueBackend, StateBackend, sqlite::SqliteStore},
    sync_state::{SyncState, SyncStateRecord},
};

#[tokio::test]
async fn queue_survives_reopen() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("history.db");
    let raws: Vec<String> = ["a", "b", "a"].iter().map(|s| s.to_string()).collect();

    {
        let store = SqliteStore::open(&path).expect("open");
        store.push("p1", &raws).await.expect("push");
        assert!(store.first_op_timestamp("p1").await.expect("ts").is_some());
    }

    let store = SqliteStore::open(&path).expect("reopen");
    assert_eq!(store.len("p1").await.expect("len"), 3);
    assert_eq!(store.range("p1", 2).await.expect("range"), vec!["a", "b"]);

    assert!(store.remove_one("p1", "a").await.expect("remove"));
    assert_eq!(store.range("p1", 10).await.expect("range"), vec!["b", "a"]);
    assert!(!store.remove_one("p1", "zzz").await.expect("remove missing"));

    assert_eq!(store.projects_with_queued_edits().await.expect("count"), 1);
    let marked = store
        .projects_with_first_op_timestamp()
        .await
        .expect("marked");
    assert_eq!(marked.len(), 1);
    assert_eq!(marked[0].0, "p1");

    store.destroy("p1").await.expect("destroy");
    assert_eq!(store.len("p1").await.expect("len"), 0);
}

#[tokio::test]
async fn store_opens_from_storage_config() {
    let dir = tempdir().expect("tempdir");
    let config = StorageConfig {
        sqlite_path: dir.path().join("configured.db").display().to_string(),
    };
    let store = SqliteStore::from_config(&config).expect("open");
    store.push("p1", &["x".to_string()]).await.expect("push");
    assert_eq!(store.len("p1").await.expect("len"), 1);
    assert!(dir.path().join("configured.db").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handles_on_one_file_write_concurrently() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("shared.db");
    let first = SqliteStore::open(&path).expect("open first");
    let second = SqliteStore::open(&path).expect("open second");

    let writer = |store: SqliteStore, project: &'static str| async move {
        for n in 0..50 {
            store.push(project, &[format!("edit-{n}")]).await?;
        }
        Ok::<_, HistoryError>(())
    };
    let (a, b) = tokio::join!(
        tokio::spawn(writer(first.clone(), "p1")),
        tokio::spawn(writer(second.clone(), "p2")),
    );
    a.expect("join").expect("first writer");
    b.expect("join").expect("second writer");

    assert_eq!(first.len("p2").await.expect("len"), 50);
    assert_eq!(second.len("p1").await.expect("len"), 50);
}

#[tokio::test]
async fn first_op_timestamp_is_only_set_once() {
    let store = SqliteStore::open_in_memory().expect("open");
    store
        .set_first_op_timestamp_if_absent("p1", 10)
        .await
        .expect("set");
    store
        .set_first_op_timestamp_if_absent("p1", 20)
        .await
        .expect("set again");
    assert_eq!(store.first_op_timestamp("p1").await.expect("ts"), Some(10));
    store.clear_first_op_timestamp("p1").await.expect("clear");
    assert_eq!(store.first_op_timestamp("p1").await.expect("ts"), None);
}

#[tokio::test]
async fn history_id_cache_expires() {
    let store = SqliteStore::open_in_memory().expect("open");
    store
        .cache_history_id("p1", "h1", Duration::from_millis(30))
        .await
        .expect("cache");
    assert_eq!(
        store.cached_history_id("p1").await.expect("cached"),
        Some("h1".to_string())
    );
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.cached_history_id("p1").await.expect("cached"), None);
}

#[tokio::test]
async fn sqlite_lock_excludes_a_second_holder() {
    let dir = tempdir().expect("tempdir");
    let store = SqliteStore::open(dir.path().join("locks.db")).expect("open");
    let lock = DistributedLock::new(
        Arc::new(store),
        LockConfig {
            ttl_ms: 10_000,
            poll_interval_ms: 5,
            max_wait_ms: 30,
            min_extension_interval_ms: 0,
        },
    );
    let key = project_lock_key("p1");
    let lease = lock.acquire(&key).await.expect("acquire");
    let err = lock.acquire(&key).await.err().expect("contended");
    assert!(matches!(err, HistoryError::LockTimeout { .. }));
    lease.extend().await.expect("extend");
    lease.release().await.expect("release");
    lock.check_lock().await.expect("health check");
}

#[tokio::test]
async fn failure_records_round_trip_through_the_ledger() {
    let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
    let ledger = FailureLedger::new(store.clone());

    let err = HistoryError::OpsOutOfOrder("doc version out of order".to_string());
    ledger.record("p1", 4, Some(&err)).await.expect("record");
    ledger.record("p1", 5, Some(&err)).await.expect("record");

    let record = ledger
        .get_failure_record("p1")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(record.attempts, 2);
    assert_eq!(record.queue_size, 5);
    assert_eq!(record.history.len(), 2);
    assert_eq!(
        ledger
            .failed_projects(FailureKind::Hard)
            .await
            .expect("hard")
            .len(),
        1
    );

    ledger.set_force_debug("p1", true).await.expect("force");
    assert!(ledger.force_debug("p1").await.expect("force debug"));

    ledger.record("p1", 0, None).await.expect("clear");
    assert!(store.failure("p1").await.expect("failure").is_none());
}

#[tokio::test]
async fn sync_state_reads_back_until_expired() {
    let store = SqliteStore::open_in_memory().expect("open");
    let mut state = SyncState::default();
    state.start_project_structure_sync();
    let record = SyncStateRecord::next(None, "p1", state.clone(), Utc::now());
    store.put_sync_state(&record).await.expect("put");

    let stored = store
        .sync_state("p1")
        .await
        .expect("get")
        .expect("present");
    assert!(stored.state.is_project_structure_syncing());
    assert_eq!(stored.resync_count, 1);

    let mut expired = SyncStateRecord::next(Some(stored), "p1", SyncState::default(), Utc::now());
    expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
    store.put_sync_state(&expired).await.expect("put");
    assert!(store.sync_state("p1").await.expect("get").is_none());
}
