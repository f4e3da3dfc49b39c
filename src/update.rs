//! Raw edits as queued by the real-time editing layer.
//!
//! A queued item is a JSON object whose shape decides its kind: a text edit
//! (`doc` + `op`), a structure edit (rename, add doc, add file) or one of the
//! two synthetic resync edits. Shapes that match none of these deserialize to
//! [`EditKind::Unrecognized`] so a single malformed item surfaces as a typed
//! translation error instead of failing the whole batch parse.

use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::HistoryResult,
    types::{DocId, FileId, Origin, TimestampMs},
    version::Version,
};

/// One queued edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEdit {
    /// Shape-specific payload.
    #[serde(flatten)]
    pub kind: EditKind,
    /// Project-structure version, present on structure edits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    /// History id the producer believed the project had.
    #[serde(
        default,
        rename = "projectHistoryId",
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_history_id"
    )]
    pub project_history_id: Option<String>,
    /// Author and bookkeeping metadata.
    #[serde(default)]
    pub meta: UpdateMeta,
}

/// Payload variants, matched in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EditKind {
    /// Authoritative whole-project structure snapshot.
    ResyncProjectStructure {
        /// Expected docs and files.
        #[serde(rename = "resyncProjectStructure")]
        structure: ProjectStructure,
        /// Only reconcile structure, never doc content.
        #[serde(
            rename = "resyncProjectStructureOnly",
            default,
            skip_serializing_if = "is_false"
        )]
        structure_only: bool,
    },
    /// Authoritative whole-document content snapshot.
    ResyncDocContent {
        /// Expected content.
        #[serde(rename = "resyncDocContent")]
        content: DocContent,
        /// Document path as seen by the metadata service.
        path: String,
        /// Document id.
        doc: DocId,
    },
    /// Text edit against one document.
    Text {
        /// Document id.
        doc: DocId,
        /// Ordered ops.
        op: Vec<TextOp>,
        /// Document version after this edit.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        v: Option<Version>,
    },
    /// Rename, or removal when `new_pathname` is empty.
    Rename {
        /// Current path.
        pathname: String,
        /// Target path; empty means delete.
        new_pathname: String,
        /// Document id when the entity is a doc.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        doc: Option<DocId>,
        /// File id when the entity is a binary file.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<FileId>,
    },
    /// New document with initial content.
    AddDoc {
        /// Document id.
        doc: DocId,
        /// Path of the new doc.
        pathname: String,
        /// Initial content.
        #[serde(rename = "docLines")]
        doc_lines: String,
        /// Tracked changes and comments side-channel.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ranges: Option<Value>,
    },
    /// New binary file.
    AddFile {
        /// File id.
        file: FileId,
        /// Path of the new file.
        pathname: String,
        /// Legacy file store URL for the bytes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// Content hash, when the producer already knows it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
        /// The blob already exists in the chunk store.
        #[serde(rename = "createdBlob", default, skip_serializing_if = "is_false")]
        created_blob: bool,
    },
    /// Anything else; rejected during translation.
    Unrecognized(Map<String, Value>),
}

/// A single text op. Positions and lengths count Unicode scalar values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextOp {
    /// Insert `i` at `p`.
    Insert {
        /// Position.
        p: usize,
        /// Inserted text.
        i: String,
        /// Undo flag.
        #[serde(default, skip_serializing_if = "is_false")]
        u: bool,
    },
    /// Delete `d` at `p`.
    Delete {
        /// Position.
        p: usize,
        /// Deleted text.
        d: String,
        /// Undo flag.
        #[serde(default, skip_serializing_if = "is_false")]
        u: bool,
    },
    /// Retain `r` chars at `p`; carries no content change.
    Retain {
        /// Position.
        p: usize,
        /// Retained length.
        r: usize,
    },
    /// Op kinds this service does not handle (comments, tracked changes).
    Other(Value),
}

impl TextOp {
    /// Position, for inserts, deletes and retains.
    pub fn position(&self) -> Option<usize> {
        match self {
            TextOp::Insert { p, .. } | TextOp::Delete { p, .. } | TextOp::Retain { p, .. } => {
                Some(*p)
            }
            TextOp::Other(_) => None,
        }
    }

    /// Comment ops (`{p, c, t}`) mark a range and change no content.
    pub fn is_comment(&self) -> bool {
        matches!(self, TextOp::Other(Value::Object(fields)) if fields.contains_key("c"))
    }

    /// Produced by an undo.
    pub fn is_undo(&self) -> bool {
        matches!(self, TextOp::Insert { u: true, .. } | TextOp::Delete { u: true, .. })
    }

    /// Length of the inserted or deleted text, zero for other ops.
    pub fn size(&self) -> usize {
        match self {
            TextOp::Insert { i, .. } => i.chars().count(),
            TextOp::Delete { d, .. } => d.chars().count(),
            _ => 0,
        }
    }

    /// An insert or delete of nothing.
    pub fn is_blank(&self) -> bool {
        match self {
            TextOp::Insert { i, .. } => i.is_empty(),
            TextOp::Delete { d, .. } => d.is_empty(),
            _ => false,
        }
    }

    /// Copy moved to `position`.
    pub fn with_position(&self, position: usize) -> TextOp {
        let mut op = self.clone();
        match &mut op {
            TextOp::Insert { p, .. } | TextOp::Delete { p, .. } | TextOp::Retain { p, .. } => {
                *p = position
            }
            TextOp::Other(_) => {}
        }
        op
    }
}

/// Side metadata attached to every edit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateMeta {
    /// Author; absent for system edits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Edit time in milliseconds. Accepts a number or an RFC 3339 string.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_ts"
    )]
    pub ts: Option<TimestampMs>,
    /// Document path for text edits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pathname: Option<String>,
    /// Document length before the edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_length: Option<i64>,
    /// Length as history sees it; wins over `doc_length` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_doc_length: Option<i64>,
    /// Hash of the document after the edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_hash: Option<String>,
    /// `external` for edits coming from an outside source.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub update_type: Option<String>,
    /// External source name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Explicit origin tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    /// Set on edits synthesized by resync expansion.
    #[serde(default, skip_serializing_if = "is_false")]
    pub resync: bool,
}

impl UpdateMeta {
    /// Edit from an outside source.
    pub fn is_external(&self) -> bool {
        self.update_type.as_deref() == Some("external")
    }
}

/// Expected project structure carried by a structure resync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectStructure {
    /// Expected editable docs.
    #[serde(default)]
    pub docs: Vec<ExpectedDoc>,
    /// Expected binary files.
    #[serde(default)]
    pub files: Vec<ExpectedFile>,
}

/// One expected doc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedDoc {
    /// Document id.
    pub doc: DocId,
    /// Unnormalized path.
    pub path: String,
}

/// One expected binary file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedFile {
    /// File id.
    pub file: FileId,
    /// Unnormalized path.
    pub path: String,
    /// Legacy file store URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Content hash.
    #[serde(rename = "_hash", default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// The blob already exists in the chunk store.
    #[serde(rename = "createdBlob", default, skip_serializing_if = "is_false")]
    pub created_blob: bool,
}

/// Expected document content carried by a doc content resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocContent {
    /// Full expected text.
    pub content: String,
}

impl RawEdit {
    /// Parses one queued JSON item.
    pub fn parse(raw: &str) -> HistoryResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Parses a batch, failing on the first malformed item.
    pub fn parse_all<S: AsRef<str>>(raws: &[S]) -> HistoryResult<Vec<Self>> {
        raws.iter().map(|raw| Self::parse(raw.as_ref())).collect()
    }

    /// Edit with no version or history id.
    pub fn new(kind: EditKind, meta: UpdateMeta) -> Self {
        Self {
            kind,
            version: None,
            project_history_id: None,
            meta,
        }
    }

    /// Text edit with a known document path.
    pub fn is_text(&self) -> bool {
        matches!(self.kind, EditKind::Text { .. }) && self.meta.pathname.is_some()
    }

    /// Rename, add doc or add file.
    pub fn is_project_structure(&self) -> bool {
        matches!(
            self.kind,
            EditKind::Rename { .. } | EditKind::AddDoc { .. } | EditKind::AddFile { .. }
        )
    }

    /// Structure resync edit.
    pub fn is_resync_structure(&self) -> bool {
        matches!(self.kind, EditKind::ResyncProjectStructure { .. })
    }

    /// Doc content resync edit.
    pub fn is_resync_doc_content(&self) -> bool {
        matches!(self.kind, EditKind::ResyncDocContent { .. })
    }

    /// Document id, for edits that concern a doc.
    pub fn doc_id(&self) -> Option<&str> {
        match &self.kind {
            EditKind::Text { doc, .. }
            | EditKind::AddDoc { doc, .. }
            | EditKind::ResyncDocContent { doc, .. } => Some(doc),
            EditKind::Rename { doc, .. } => doc.as_deref(),
            _ => None,
        }
    }

    /// Path the edit applies to, before normalization.
    pub fn pathname(&self) -> Option<&str> {
        match &self.kind {
            EditKind::Text { .. } => self.meta.pathname.as_deref(),
            EditKind::Rename { pathname, .. }
            | EditKind::AddDoc { pathname, .. }
            | EditKind::AddFile { pathname, .. } => Some(pathname),
            EditKind::ResyncDocContent { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Document version of a text edit.
    pub fn doc_version(&self) -> Option<&Version> {
        match &self.kind {
            EditKind::Text { v, .. } => v.as_ref(),
            _ => None,
        }
    }

    /// Ops of a text edit.
    pub fn text_ops(&self) -> Option<&[TextOp]> {
        match &self.kind {
            EditKind::Text { op, .. } => Some(op),
            _ => None,
        }
    }

    /// Number of ops this edit contributes to a batch's op budget.
    pub fn op_count(&self) -> usize {
        match &self.kind {
            EditKind::Text { op, .. } => op.len(),
            _ => 1,
        }
    }

    /// Copy of this text edit with its ops replaced.
    pub fn with_ops(&self, ops: Vec<TextOp>) -> RawEdit {
        let mut edit = self.clone();
        if let EditKind::Text { op, .. } = &mut edit.kind {
            *op = ops;
        }
        edit
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn deserialize_ts<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<TimestampMs>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Millis(i64),
        Float(f64),
        Text(String),
    }

    match Option::<Repr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Repr::Millis(ms)) => Ok(Some(ms)),
        Some(Repr::Float(ms)) => Ok(Some(ms as TimestampMs)),
        Some(Repr::Text(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| Some(dt.timestamp_millis()))
            .map_err(serde::de::Error::custom),
    }
}

fn deserialize_history_id<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    Ok(Option::<Repr>::deserialize(deserializer)?.map(|id| match id {
        Repr::Number(n) => n.to_string(),
        Repr::Text(s) => s,
    }))
}
