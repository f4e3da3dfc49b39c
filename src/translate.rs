//! Raw edits to canonical changes, and the path normalization shared with
//! resync.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use crate::{
    blob::EditWithBlobs,
    change::{Change, DocVersion, FileRef, Operation},
    error::{HistoryError, HistoryResult},
    text_operation::TextOperation,
    types::{Origin, TimestampMs},
    update::{EditKind, TextOp, UpdateMeta},
    version::Version,
};

const ANONYMOUS_USER: &str = "anonymous-user";

/// Maps an editor path to its stored form.
///
/// Leading slashes are dropped, backslashes become underscores, asterisks
/// and a leading space in any segment are escaped. Applying it twice gives
/// the same result as applying it once.
pub fn normalize_pathname(pathname: &str) -> String {
    pathname
        .trim_start_matches('/')
        .replace('\\', "_")
        .replace('*', "__ASTERISK__")
        .split('/')
        .map(|segment| match segment.strip_prefix(' ') {
            Some(rest) => format!("__SPACE__{rest}"),
            None => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn checked_pathname(pathname: &str) -> HistoryResult<String> {
    let normalized = normalize_pathname(pathname);
    if normalized.is_empty() {
        return Err(HistoryError::InvalidPathname(pathname.to_string()));
    }
    Ok(normalized)
}

/// Translates every edit into one change, in order.
pub fn convert_to_changes(project_id: &str, edits: &[EditWithBlobs]) -> HistoryResult<Vec<Change>> {
    let changes = edits
        .iter()
        .map(convert_to_change)
        .collect::<HistoryResult<Vec<_>>>()?;
    debug!(project_id, count = changes.len(), "translated edits");
    Ok(changes)
}

fn convert_to_change(item: &EditWithBlobs) -> HistoryResult<Change> {
    let edit = &item.edit;
    let mut change = Change {
        operations: Vec::new(),
        authors: Vec::new(),
        v2_authors: authors(&edit.meta),
        timestamp: timestamp(edit.meta.ts),
        project_version: None,
        v2_doc_versions: None,
        origin: origin(&edit.meta),
    };

    match &edit.kind {
        EditKind::Rename {
            pathname,
            new_pathname,
            ..
        } => {
            change.operations.push(Operation::Rename {
                pathname: checked_pathname(pathname)?,
                new_pathname: normalize_pathname(new_pathname),
            });
            change.project_version = edit.version.clone();
        }
        EditKind::AddDoc {
            pathname, doc_lines, ..
        } => {
            let hashes = item.blob_hashes.as_ref().ok_or(HistoryError::UnknownUpdateFormat)?;
            change.operations.push(Operation::AddFile {
                pathname: checked_pathname(pathname)?,
                file: FileRef {
                    hash: Some(hashes.file.clone()),
                    ranges_hash: hashes.ranges.clone(),
                    string_length: Some(doc_lines.chars().count()),
                    content: None,
                },
            });
            change.project_version = edit.version.clone();
        }
        EditKind::AddFile { pathname, .. } => {
            let hashes = item.blob_hashes.as_ref().ok_or(HistoryError::UnknownUpdateFormat)?;
            change.operations.push(Operation::AddFile {
                pathname: checked_pathname(pathname)?,
                file: FileRef {
                    hash: Some(hashes.file.clone()),
                    ..FileRef::default()
                },
            });
            change.project_version = edit.version.clone();
        }
        EditKind::Text { doc, op, v } => {
            let Some(raw_pathname) = edit.meta.pathname.as_deref() else {
                return Err(HistoryError::UnknownUpdateFormat);
            };
            let pathname = checked_pathname(raw_pathname)?;
            change.operations.push(Operation::EditText {
                pathname: pathname.clone(),
                text_operation: text_operation(&edit.meta, op)?,
            });
            change.v2_doc_versions = Some(BTreeMap::from([(
                doc.clone(),
                DocVersion {
                    pathname,
                    v: v.clone().unwrap_or(Version::Number(0)),
                },
            )]));
        }
        EditKind::ResyncProjectStructure { .. }
        | EditKind::ResyncDocContent { .. }
        | EditKind::Unrecognized(_) => return Err(HistoryError::UnknownUpdateFormat),
    }
    Ok(change)
}

/// Composes the ops of one text edit into a single operation over the whole
/// document, starting from the length recorded in `meta`.
pub fn text_operation(meta: &UpdateMeta, ops: &[TextOp]) -> HistoryResult<TextOperation> {
    let length = meta
        .history_doc_length
        .or(meta.doc_length)
        .ok_or_else(|| HistoryError::InvalidTextOperation("missing doc_length".to_string()))?;
    // empty documents are sometimes reported with length -1
    let mut length = length.max(0) as usize;

    let mut composed: Option<TextOperation> = None;
    for op in ops {
        let step = match op {
            TextOp::Insert { p, i, .. } => {
                let p = (*p).min(length);
                TextOperation::new().retain(p).insert(i).retain(length - p)
            }
            TextOp::Delete { p, d, .. } => {
                let n = d.chars().count();
                if p + n > length {
                    return Err(HistoryError::InvalidTextOperation(format!(
                        "delete of {n} chars at {p} past document length {length}"
                    )));
                }
                TextOperation::new().retain(*p).delete(n).retain(length - p - n)
            }
            TextOp::Retain { .. } => TextOperation::new().retain(length),
            TextOp::Other(_) if op.is_comment() => continue,
            TextOp::Other(_) => return Err(HistoryError::UnexpectedOpType),
        };
        length = step.target_length();
        composed = Some(match composed {
            Some(previous) => previous.compose(&step)?,
            None => step,
        });
    }
    Ok(composed.unwrap_or_else(|| TextOperation::new().retain(length)))
}

fn authors(meta: &UpdateMeta) -> Vec<Option<String>> {
    match meta.user_id.as_deref() {
        Some(ANONYMOUS_USER) => vec![None],
        Some(user_id) => vec![Some(user_id.to_string())],
        None => Vec::new(),
    }
}

fn timestamp(ts: Option<TimestampMs>) -> String {
    ts.and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn origin(meta: &UpdateMeta) -> Option<Origin> {
    if let Some(origin) = &meta.origin {
        return Some(origin.clone());
    }
    match (&meta.source, meta.is_external()) {
        (Some(source), true) => Some(Origin::kind(source.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_pathname;

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_pathname("/main.tex"), "main.tex");
        assert_eq!(normalize_pathname("/\\main\\foo.tex"), "_main_foo.tex");
        assert_eq!(normalize_pathname("/test*test.png"), "test__ASTERISK__test.png");
        assert_eq!(normalize_pathname("/ test.png"), "__SPACE__test.png");
        assert_eq!(normalize_pathname("/folder/ test.png"), "folder/__SPACE__test.png");
        assert_eq!(normalize_pathname("//a"), "a");
    }
}
