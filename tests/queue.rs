use std::sync::Arc;

use serde_json::json;

use project_history::{
    config::QueueConfig,
    queue::UpdateQueueReader,
    store::{QueueBackend, memory::MemoryStore},
};

const PROJECT: &str = "project-1";

fn raw(n: usize) -> String {
    json!({
        "doc": "d1",
        "op": [{"p": 0, "i": format!("{n:04}")}],
        "v": n,
        "meta": {"ts": 1000 + n, "pathname": "/main.tex", "doc_length": n * 4},
    })
    .to_string()
}

async fn queue_with(config: QueueConfig, count: usize) -> (Arc<MemoryStore>, UpdateQueueReader, Vec<String>) {
    let store = Arc::new(MemoryStore::new());
    let raws: Vec<String> = (0..count).map(raw).collect();
    store.push(PROJECT, &raws).await.expect("push");
    let reader = UpdateQueueReader::new(store.clone(), config);
    (store, reader, raws)
}

#[tokio::test]
async fn byte_cap_stops_the_batch_at_the_item_that_reaches_it() {
    let raws: Vec<String> = (0..10).map(raw).collect();
    let threshold: usize = raws[..3].iter().map(String::len).sum();
    let config = QueueConfig {
        raw_update_size_threshold: threshold,
        ..QueueConfig::default()
    };
    let (_store, reader, raws) = queue_with(config, 10).await;

    let batch = reader.read_batch(PROJECT, 500).await.expect("read");
    assert_eq!(batch.len(), 3);
    assert_eq!(batch.raws, raws[..3].to_vec());
    assert!(batch.has_more);
}

#[tokio::test]
async fn op_cap_limits_the_batch() {
    let config = QueueConfig {
        max_update_op_length: 2,
        ..QueueConfig::default()
    };
    let (_store, reader, _) = queue_with(config, 5).await;
    let batch = reader.read_batch(PROJECT, 500).await.expect("read");
    assert_eq!(batch.len(), 2);
    assert!(batch.has_more);
}

#[tokio::test]
async fn doc_content_resyncs_are_capped() {
    let store = Arc::new(MemoryStore::new());
    let raws: Vec<String> = (0..4)
        .map(|n| {
            json!({
                "resyncDocContent": {"content": "x"},
                "path": format!("/doc{n}.tex"),
                "doc": format!("d{n}"),
                "meta": {"ts": 1},
            })
            .to_string()
        })
        .collect();
    store.push(PROJECT, &raws).await.expect("push");
    let reader = UpdateQueueReader::new(
        store,
        QueueConfig {
            max_new_doc_content_count: 2,
            ..QueueConfig::default()
        },
    );
    let batch = reader.read_batch(PROJECT, 500).await.expect("read");
    assert_eq!(batch.len(), 2);
}

#[tokio::test]
async fn short_read_has_no_more() {
    let (_store, reader, _) = queue_with(QueueConfig::default(), 3).await;
    let batch = reader.read_batch(PROJECT, 10).await.expect("read");
    assert_eq!(batch.len(), 3);
    assert!(!batch.has_more);

    let batch = reader.read_batch(PROJECT, 3).await.expect("read");
    assert!(batch.has_more, "a full read may leave items behind");
}

#[tokio::test]
async fn empty_queue_reads_empty_batch() {
    let reader = UpdateQueueReader::new(Arc::new(MemoryStore::new()), QueueConfig::default());
    let batch = reader.read_batch(PROJECT, 10).await.expect("read");
    assert!(batch.is_empty());
    assert!(!batch.has_more);
}

#[tokio::test]
async fn delete_removes_each_item_once_and_clears_marker_when_empty() {
    let (store, reader, raws) = queue_with(QueueConfig::default(), 2).await;
    store.push(PROJECT, &[raws[0].clone()]).await.expect("push duplicate");
    assert_eq!(reader.count(PROJECT).await.expect("count"), 3);

    assert!(reader.delete(PROJECT, &raws[..1], true).await.expect("delete"));
    assert_eq!(reader.count(PROJECT).await.expect("count"), 2);
    assert!(store.first_op_timestamp(PROJECT).await.expect("ts").is_some());

    let rest = vec![raws[1].clone(), raws[0].clone()];
    assert!(reader.delete(PROJECT, &rest, true).await.expect("delete"));
    assert_eq!(reader.count(PROJECT).await.expect("count"), 0);
    assert!(store.first_op_timestamp(PROJECT).await.expect("ts").is_none());
}

#[tokio::test]
async fn delete_of_missing_items_keeps_the_marker() {
    let (store, reader, raws) = queue_with(QueueConfig::default(), 1).await;
    store.destroy(PROJECT).await.expect("destroy");
    assert!(!reader.delete(PROJECT, &raws, true).await.expect("delete"));
    assert!(store.first_op_timestamp(PROJECT).await.expect("ts").is_some());

    assert!(reader
        .clear_dangling_first_op_timestamp(PROJECT)
        .await
        .expect("clear"));
    assert!(store.first_op_timestamp(PROJECT).await.expect("ts").is_none());
}

#[tokio::test]
async fn counts_projects_with_pending_edits() {
    let (store, reader, _) = queue_with(QueueConfig::default(), 2).await;
    store.push("project-2", &[raw(9)]).await.expect("push");
    assert_eq!(reader.count_projects().await.expect("count"), 2);

    reader.destroy("project-2").await.expect("destroy");
    assert_eq!(reader.count_projects().await.expect("count"), 1);
    assert!(store.first_op_timestamp("project-2").await.expect("ts").is_none());
}
