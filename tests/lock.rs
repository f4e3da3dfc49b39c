use std::sync::Arc;
use std::time::Duration;

use project_history::{
    config::LockConfig,
    error::HistoryError,
    lock::{DistributedLock, project_lock_key},
    store::memory::MemoryStore,
};

fn lock(ttl_ms: u64) -> DistributedLock {
    DistributedLock::new(
        Arc::new(MemoryStore::new()),
        LockConfig {
            ttl_ms,
            poll_interval_ms: 5,
            max_wait_ms: 50,
            min_extension_interval_ms: 0,
        },
    )
}

#[test]
fn project_keys_wrap_the_id_in_braces() {
    assert_eq!(project_lock_key("abc"), "ProjectHistoryLock:{abc}");
}

#[tokio::test]
async fn second_acquirer_times_out_while_lock_is_held() {
    let lock = lock(10_000);
    let key = project_lock_key("p1");
    let lease = lock.acquire(&key).await.expect("first acquire");

    let err = lock.acquire(&key).await.err().expect("contended");
    assert!(matches!(err, HistoryError::LockTimeout { .. }));
    assert!(err.is_temporary());

    lease.release().await.expect("release");
    let again = lock.acquire(&key).await.expect("acquire after release");
    again.release().await.expect("release");
}

#[tokio::test]
async fn different_projects_do_not_contend() {
    let lock = lock(10_000);
    let a = lock.acquire(&project_lock_key("a")).await.expect("a");
    let b = lock.acquire(&project_lock_key("b")).await.expect("b");
    a.release().await.expect("release a");
    b.release().await.expect("release b");
}

#[tokio::test]
async fn expired_lease_cannot_extend_or_release_a_foreign_lock() {
    let lock = lock(100);
    let key = project_lock_key("p1");
    let stale = lock.acquire(&key).await.expect("first acquire");
    tokio::time::sleep(Duration::from_millis(150)).await;

    let fresh = lock.acquire(&key).await.expect("acquire after expiry");
    assert_ne!(stale.value(), fresh.value());

    let err = stale.extend().await.err().expect("extend fails");
    assert!(matches!(err, HistoryError::LockExtend { .. }));
    let err = stale.release().await.err().expect("release fails");
    assert!(matches!(err, HistoryError::LockRelease { .. }));

    // the fresh holder is unaffected
    fresh.extend().await.expect("fresh extend");
    fresh.release().await.expect("fresh release");
}

#[tokio::test]
async fn run_locked_releases_after_failure() {
    let lock = lock(10_000);
    let key = project_lock_key("p1");
    let result: Result<(), HistoryError> = lock
        .run_locked(&key, |_lease| async { Err(HistoryError::UnexpectedOpType) })
        .await;
    assert!(matches!(result, Err(HistoryError::UnexpectedOpType)));

    let value = lock
        .run_locked(&key, |lease| async move {
            lease.extend().await?;
            Ok(lease.key().to_string())
        })
        .await
        .expect("second run");
    assert_eq!(value, key);
}

#[tokio::test]
async fn health_check_round_trips() {
    lock(10_000).check_lock().await.expect("health check");
}
