mod common;

use proptest::prelude::*;
use serde_json::{Value, json};

use common::parse;
use project_history::{
    blob::{BlobHashes, EditWithBlobs},
    error::HistoryError,
    translate::{convert_to_changes, normalize_pathname},
};

fn translate(edit: Value) -> Result<Vec<Value>, HistoryError> {
    let edits = [EditWithBlobs::without_blobs(parse(edit))];
    Ok(convert_to_changes("project-1", &edits)?
        .iter()
        .map(|change| serde_json::to_value(change).expect("json"))
        .collect())
}

fn text(ops: Value, doc_length: i64) -> Value {
    json!({
        "doc": "doc-1",
        "op": ops,
        "v": 42,
        "meta": {
            "user_id": "user-1",
            "ts": 1_700_000_000_000i64,
            "pathname": "/main.tex",
            "doc_length": doc_length,
        }
    })
}

fn text_operation(edit: Value) -> Value {
    let changes = translate(edit).expect("translate");
    changes[0]["operations"][0]["textOperation"].clone()
}

#[test]
fn two_inserts_compose_into_one_operation() {
    let op = text_operation(text(json!([{"p": 3, "i": "foo"}, {"p": 15, "i": "bar"}]), 20));
    assert_eq!(op, json!([3, "foo", 9, "bar", 8]));
}

#[test]
fn two_deletes_compose_into_one_operation() {
    let op = text_operation(text(json!([{"p": 3, "d": "12"}, {"p": 10, "d": "345"}]), 20));
    assert_eq!(op, json!([3, -2, 7, -3, 5]));
}

#[test]
fn insert_then_matching_delete_is_a_retain() {
    let op = text_operation(text(json!([{"p": 3, "i": "foo"}, {"p": 3, "d": "foo"}]), 20));
    assert_eq!(op, json!([20]));
}

#[test]
fn retain_op_keeps_the_whole_document() {
    let op = text_operation(text(json!([{"p": 0, "r": 20}]), 20));
    assert_eq!(op, json!([20]));
}

#[test]
fn insert_at_the_end_has_no_trailing_retain() {
    let op = text_operation(text(json!([{"p": 2, "i": "\\"}]), 2));
    assert_eq!(op, json!([2, "\\"]));
}

#[test]
fn insert_past_the_end_is_clamped() {
    let op = text_operation(text(json!([{"p": 10, "i": "x"}]), 5));
    assert_eq!(op, json!([5, "x"]));
}

#[test]
fn history_doc_length_wins_over_doc_length() {
    let mut edit = text(json!([{"p": 0, "i": "a"}]), 99);
    edit["meta"]["history_doc_length"] = json!(3);
    assert_eq!(text_operation(edit), json!(["a", 3]));
}

#[test]
fn comment_ops_are_skipped() {
    let op = text_operation(text(
        json!([{"p": 1, "c": "note", "t": "thread-1"}, {"p": 0, "i": "x"}]),
        4,
    ));
    assert_eq!(op, json!(["x", 4]));
}

#[test]
fn positions_count_chars() {
    let op = text_operation(text(json!([{"p": 2, "i": "é"}, {"p": 3, "d": "ü"}]), 4));
    assert_eq!(op, json!([2, "é", -1, 1]));
}

#[test]
fn delete_past_the_end_is_rejected() {
    let err = translate(text(json!([{"p": 3, "d": "abc"}]), 4)).expect_err("invalid");
    assert!(matches!(err, HistoryError::InvalidTextOperation(_)));
}

#[test]
fn missing_doc_length_is_rejected() {
    let mut edit = text(json!([{"p": 0, "i": "a"}]), 0);
    edit["meta"].as_object_mut().expect("meta").remove("doc_length");
    let err = translate(edit).expect_err("invalid");
    assert!(matches!(err, HistoryError::InvalidTextOperation(_)));
}

#[test]
fn unknown_op_shape_is_rejected() {
    let err = translate(text(json!([{"p": 0, "x": 1}]), 4)).expect_err("invalid");
    assert!(matches!(err, HistoryError::UnexpectedOpType));
}

#[test]
fn text_change_carries_doc_version_authors_and_timestamp() {
    let changes = translate(text(json!([{"p": 0, "i": "a"}]), 0)).expect("translate");
    assert_eq!(
        changes,
        vec![json!({
            "operations": [{"pathname": "main.tex", "textOperation": ["a"]}],
            "authors": [],
            "v2Authors": ["user-1"],
            "timestamp": "2023-11-14T22:13:20.000Z",
            "v2DocVersions": {"doc-1": {"pathname": "main.tex", "v": 42}},
        })]
    );
}

#[test]
fn anonymous_user_becomes_null_author() {
    let mut edit = text(json!([{"p": 0, "i": "a"}]), 0);
    edit["meta"]["user_id"] = json!("anonymous-user");
    let changes = translate(edit).expect("translate");
    assert_eq!(changes[0]["v2Authors"], json!([null]));
}

#[test]
fn external_source_becomes_origin() {
    let mut edit = text(json!([{"p": 0, "i": "a"}]), 0);
    edit["meta"]["type"] = json!("external");
    edit["meta"]["source"] = json!("dropbox");
    let changes = translate(edit).expect("translate");
    assert_eq!(changes[0]["origin"], json!({"kind": "dropbox"}));
}

#[test]
fn explicit_origin_wins() {
    let mut edit = text(json!([{"p": 0, "i": "a"}]), 0);
    edit["meta"]["type"] = json!("external");
    edit["meta"]["source"] = json!("dropbox");
    edit["meta"]["origin"] = json!({"kind": "history-resync"});
    let changes = translate(edit).expect("translate");
    assert_eq!(changes[0]["origin"], json!({"kind": "history-resync"}));
}

#[test]
fn rename_and_remove() {
    let rename = json!({
        "pathname": "/old.tex",
        "new_pathname": "/new.tex",
        "doc": "doc-1",
        "version": "7.1",
        "meta": {"user_id": "user-1", "ts": 1_700_000_000_000i64},
    });
    let changes = translate(rename).expect("translate");
    assert_eq!(
        changes[0]["operations"],
        json!([{"pathname": "old.tex", "newPathname": "new.tex"}])
    );
    assert_eq!(changes[0]["projectVersion"], json!("7.1"));

    let remove = json!({
        "pathname": "/old.tex",
        "new_pathname": "",
        "doc": "doc-1",
        "meta": {"ts": 1_700_000_000_000i64},
    });
    let changes = translate(remove).expect("translate");
    assert_eq!(
        changes[0]["operations"],
        json!([{"pathname": "old.tex", "newPathname": ""}])
    );
    assert_eq!(changes[0]["v2Authors"], json!([]));
}

#[test]
fn add_doc_uses_blob_hashes() {
    let edit = parse(json!({
        "doc": "doc-2",
        "pathname": "/chapters/one.tex",
        "docLines": "héllo",
        "version": "8",
        "meta": {"user_id": "user-1", "ts": 1_700_000_000_000i64},
    }));
    let item = EditWithBlobs {
        edit,
        blob_hashes: Some(BlobHashes {
            file: "abc".to_string(),
            ranges: Some("def".to_string()),
        }),
    };
    let changes = convert_to_changes("project-1", &[item]).expect("translate");
    let change = serde_json::to_value(&changes[0]).expect("json");
    assert_eq!(
        change["operations"],
        json!([{
            "pathname": "chapters/one.tex",
            "file": {"hash": "abc", "rangesHash": "def", "stringLength": 5},
        }])
    );
}

#[test]
fn add_doc_without_blobs_is_rejected() {
    let err = translate(json!({
        "doc": "doc-2",
        "pathname": "/a.tex",
        "docLines": "",
        "meta": {"ts": 1},
    }))
    .expect_err("no blobs");
    assert!(matches!(err, HistoryError::UnknownUpdateFormat));
}

#[test]
fn unrecognized_edit_is_rejected() {
    let err = translate(json!({"something": "else", "meta": {"ts": 1}})).expect_err("unknown");
    assert!(matches!(err, HistoryError::UnknownUpdateFormat));
}

#[test]
fn empty_pathname_is_rejected() {
    let edit = json!({
        "pathname": "/",
        "new_pathname": "/a.tex",
        "meta": {"ts": 1},
    });
    let err = translate(edit).expect_err("empty path");
    assert!(matches!(err, HistoryError::InvalidPathname(_)));
}

proptest! {
    #[test]
    fn normalization_is_idempotent(path in "[/ a-z*\\\\.]{0,24}") {
        let once = normalize_pathname(&path);
        prop_assert_eq!(normalize_pathname(&once), once.clone());
        prop_assert!(!once.starts_with('/'));
        prop_assert!(!once.contains('\\'));
        prop_assert!(!once.contains('*'));
    }
}
