//! Merges queued text edits into the smallest equivalent sequence.
//!
//! The pass runs in four stages: split multi-op edits into single-op edits
//! carrying a running document length, left-fold adjacent pairs through the
//! merge rules, drop blank ops, then re-join adjacent ops that target the same
//! document version. The pass is repeated until it stops changing its input,
//! so compressing an already compressed batch is a no-op.

use std::time::Duration;

use tracing::debug;

use crate::{
    config::CompressorConfig,
    diff::diff_as_text_ops,
    error::{HistoryError, HistoryResult},
    update::{EditKind, RawEdit, TextOp},
};

const MAX_PASSES: usize = 16;

/// Stateless compressor configured with merge limits.
#[derive(Debug, Clone)]
pub struct OperationCompressor {
    max_time_between_updates_ms: i64,
    max_update_size: usize,
    diff_timeout: Duration,
}

impl OperationCompressor {
    /// Takes the merge window, size cap and diff budget from `config`.
    pub fn new(config: &CompressorConfig) -> Self {
        Self {
            max_time_between_updates_ms: config.max_time_between_updates_ms as i64,
            max_update_size: config.max_update_size,
            diff_timeout: config.diff_timeout(),
        }
    }

    /// Compresses a batch of raw edits. Non-text edits pass through untouched
    /// and act as merge barriers.
    pub fn compress(&self, edits: Vec<RawEdit>) -> HistoryResult<Vec<RawEdit>> {
        let input_len = edits.len();
        let mut current = self.compress_pass(edits)?;
        for _ in 1..MAX_PASSES {
            let next = self.compress_pass(current.clone())?;
            if next == current {
                break;
            }
            current = next;
        }
        debug!(input = input_len, output = current.len(), "compressed edits");
        Ok(current)
    }

    fn compress_pass(&self, edits: Vec<RawEdit>) -> HistoryResult<Vec<RawEdit>> {
        let edits = convert_to_single_op_updates(edits)?;
        let edits = self.compress_updates(edits)?;
        let edits = filter_blank_updates(edits);
        Ok(concat_updates_with_same_version(edits))
    }

    /// Left fold over single-op edits.
    pub fn compress_updates(&self, edits: Vec<RawEdit>) -> HistoryResult<Vec<RawEdit>> {
        let mut out: Vec<RawEdit> = Vec::with_capacity(edits.len());
        for edit in edits {
            match out.pop() {
                Some(last) => out.extend(self.concat_two_updates(last, edit)?),
                None => out.push(edit),
            }
        }
        Ok(out)
    }

    fn concat_two_updates(&self, first: RawEdit, second: RawEdit) -> HistoryResult<Vec<RawEdit>> {
        let (Some(first_op), Some(second_op)) = (single_text_op(&first), single_text_op(&second))
        else {
            return Ok(vec![first, second]);
        };

        if first.doc_id() != second.doc_id() || first.meta.pathname != second.meta.pathname {
            return Ok(vec![first, second]);
        }
        if first.meta.user_id != second.meta.user_id {
            return Ok(vec![first, second]);
        }
        if first.meta.is_external() != second.meta.is_external()
            || (first.meta.is_external() && first.meta.source != second.meta.source)
        {
            return Ok(vec![first, second]);
        }
        let gap = second.meta.ts.unwrap_or(0) - first.meta.ts.unwrap_or(0);
        if gap > self.max_time_between_updates_ms {
            return Ok(vec![first, second]);
        }
        if first_op.is_undo() != second_op.is_undo() {
            return Ok(vec![first, second]);
        }

        let first_size = first_op.size();
        let second_size = second_op.size();
        let (Some(first_p), Some(second_p)) = (first_op.position(), second_op.position()) else {
            return Ok(vec![first, second]);
        };
        let first_inside_second = second_p <= first_p && first_p <= second_p + second_size;
        let second_inside_first = first_p <= second_p && second_p <= first_p + first_size;
        let under_limit = first_size + second_size < self.max_update_size;

        let merged = match (first_op, second_op) {
            (TextOp::Insert { i: i1, u, .. }, TextOp::Insert { i: i2, .. })
                if second_inside_first && under_limit =>
            {
                let op = TextOp::Insert {
                    p: first_p,
                    i: str_inject(i1, second_p - first_p, i2),
                    u: *u,
                };
                vec![merge_updates_with_op(&first, &second, op)]
            }
            (TextOp::Delete { d: d1, .. }, TextOp::Delete { d: d2, u, .. })
                if first_inside_second && under_limit =>
            {
                let op = TextOp::Delete {
                    p: second_p,
                    d: str_inject(d2, first_p - second_p, d1),
                    u: *u,
                };
                vec![merge_updates_with_op(&first, &second, op)]
            }
            (TextOp::Insert { i, u, .. }, TextOp::Delete { d, .. }) if second_inside_first => {
                let offset = second_p - first_p;
                let deleted_len = d.chars().count();
                let inserted: String = i.chars().skip(offset).take(deleted_len).collect();
                if &inserted != d {
                    // the delete reaches past the end of the insert
                    return Ok(vec![first, second]);
                }
                let remaining = str_remove(i, offset, deleted_len);
                if remaining.is_empty() {
                    Vec::new()
                } else {
                    let op = TextOp::Insert {
                        p: first_p,
                        i: remaining,
                        u: *u,
                    };
                    vec![merge_updates_with_op(&first, &second, op)]
                }
            }
            (TextOp::Delete { d, u: u1, .. }, TextOp::Insert { i, u: u2, .. })
                if first_p == second_p =>
            {
                self.diff_updates(&first, &second, d, i, first_p, *u1 && *u2)?
            }
            _ => return Ok(vec![first, second]),
        };
        Ok(merged)
    }

    /// Re-expresses a delete followed by an insert at the same place as a
    /// minimal diff so unchanged text inside a paste is not rewritten.
    fn diff_updates(
        &self,
        first: &RawEdit,
        second: &RawEdit,
        deleted: &str,
        inserted: &str,
        offset: usize,
        undo: bool,
    ) -> HistoryResult<Vec<RawEdit>> {
        let mut out: Vec<RawEdit> = diff_as_text_ops(deleted, inserted, self.diff_timeout)
            .into_iter()
            .map(|op| {
                let op = match op {
                    TextOp::Insert { p, i, .. } => TextOp::Insert {
                        p: p + offset,
                        i,
                        u: undo,
                    },
                    TextOp::Delete { p, d, .. } => TextOp::Delete {
                        p: p + offset,
                        d,
                        u: undo,
                    },
                    other => other,
                };
                let mut edit = merge_updates_with_op(first, second, op);
                edit.meta.doc_hash = None;
                edit
            })
            .collect();

        if let (Some(hash), Some(last)) = (&second.meta.doc_hash, out.last_mut()) {
            last.meta.doc_hash = Some(hash.clone());
        }

        let mut doc_length = first.meta.history_doc_length.or(first.meta.doc_length);
        for edit in &mut out {
            edit.meta.doc_length = doc_length;
            edit.meta.history_doc_length = None;
            if let (Some(len), Some(op)) = (doc_length, single_text_op(edit)) {
                doc_length = Some(adjust_length_by_op(len, op)?);
            }
        }
        Ok(out)
    }
}

/// Splits every text edit into one edit per op, tagging each with the
/// document length before it applies. Only the last split keeps `doc_hash`.
pub fn convert_to_single_op_updates(edits: Vec<RawEdit>) -> HistoryResult<Vec<RawEdit>> {
    let mut out = Vec::with_capacity(edits.len());
    for edit in edits {
        let Some(ops) = edit.text_ops() else {
            out.push(edit);
            continue;
        };

        let mut doc_length = edit.meta.history_doc_length.or(edit.meta.doc_length);
        // empty documents are sometimes reported with length -1
        if doc_length == Some(-1) {
            doc_length = Some(0);
        }
        let start = out.len();
        for op in ops {
            let mut split = edit.with_ops(vec![op.clone()]);
            split.meta.doc_hash = None;
            if let Some(len) = doc_length {
                split.meta.doc_length = Some(len);
                split.meta.history_doc_length = None;
                doc_length = Some(adjust_length_by_op(len, op)?);
            }
            out.push(split);
        }
        if out.len() > start {
            if let Some(last) = out.last_mut() {
                last.meta.doc_hash = edit.meta.doc_hash.clone();
            }
        }
    }
    Ok(out)
}

/// Drops empty inserts and deletes produced by diffing.
pub fn filter_blank_updates(edits: Vec<RawEdit>) -> Vec<RawEdit> {
    edits
        .into_iter()
        .filter(|edit| !single_text_op(edit).is_some_and(TextOp::is_blank))
        .collect()
}

/// Joins adjacent text edits that share document, path and version.
pub fn concat_updates_with_same_version(edits: Vec<RawEdit>) -> Vec<RawEdit> {
    let mut out: Vec<RawEdit> = Vec::with_capacity(edits.len());
    for edit in edits {
        if let Some(ops) = edit.text_ops() {
            if let Some(last) = out.last_mut() {
                let joinable = last.text_ops().is_some()
                    && last.doc_version() == edit.doc_version()
                    && last.doc_id() == edit.doc_id()
                    && last.meta.pathname == edit.meta.pathname;
                if joinable {
                    if let EditKind::Text { op, .. } = &mut last.kind {
                        op.extend(ops.iter().cloned());
                    }
                    last.meta.doc_hash = edit.meta.doc_hash.clone();
                    continue;
                }
            }
        }
        out.push(edit);
    }
    out
}

/// Document length after applying `op` to a document of `length` chars.
pub fn adjust_length_by_op(length: i64, op: &TextOp) -> HistoryResult<i64> {
    match op {
        TextOp::Insert { i, .. } => Ok(length + i.chars().count() as i64),
        TextOp::Delete { d, .. } => Ok(length - d.chars().count() as i64),
        TextOp::Retain { .. } => Ok(length),
        TextOp::Other(_) if op.is_comment() => Ok(length),
        TextOp::Other(_) => Err(HistoryError::UnexpectedOpType),
    }
}

fn single_text_op(edit: &RawEdit) -> Option<&TextOp> {
    match edit.text_ops() {
        Some([op]) => Some(op),
        _ => None,
    }
}

/// First edit's metadata and timestamp, second edit's version and hash.
fn merge_updates_with_op(first: &RawEdit, second: &RawEdit, op: TextOp) -> RawEdit {
    let mut edit = first.with_ops(vec![op]);
    if let (EditKind::Text { v, .. }, Some(second_v)) = (&mut edit.kind, second.doc_version()) {
        *v = Some(second_v.clone());
    }
    edit.meta.doc_hash = second.meta.doc_hash.clone();
    edit
}

fn str_inject(base: &str, position: usize, text: &str) -> String {
    let mut out: String = base.chars().take(position).collect();
    out.push_str(text);
    out.extend(base.chars().skip(position));
    out
}

fn str_remove(base: &str, position: usize, length: usize) -> String {
    base.chars()
        .enumerate()
        .filter(|(idx, _)| *idx < position || *idx >= position + length)
        .map(|(_, c)| c)
        .collect()
}
