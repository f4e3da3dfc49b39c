//! Canonical commit-ready changes as accepted by the chunk store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    text_operation::TextOperation,
    types::{DocId, Origin},
    version::Version,
};

/// One history version slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Operations applied in order.
    pub operations: Vec<Operation>,
    /// Legacy author list, always empty on new changes.
    #[serde(default)]
    pub authors: Vec<Value>,
    /// Author ids; `null` marks an anonymous author.
    #[serde(default)]
    pub v2_authors: Vec<Option<String>>,
    /// ISO 8601 timestamp.
    pub timestamp: String,
    /// Project structure version after this change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_version: Option<Version>,
    /// Document versions after this change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v2_doc_versions: Option<BTreeMap<DocId, DocVersion>>,
    /// Origin tag such as `{"kind": "history-resync"}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

/// Version of one document at a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocVersion {
    /// Path of the document when the change was made.
    pub pathname: String,
    /// Document version.
    pub v: Version,
}

/// A single operation within a [`Change`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operation {
    /// Edit the text of an editable file.
    EditText {
        /// Target path.
        pathname: String,
        /// Edit covering the whole file.
        #[serde(rename = "textOperation")]
        text_operation: TextOperation,
    },
    /// Add (or replace) a file by blob reference.
    AddFile {
        /// Target path.
        pathname: String,
        /// Blob reference.
        file: FileRef,
    },
    /// Move a file; an empty `new_pathname` removes it.
    Rename {
        /// Current path.
        pathname: String,
        /// New path.
        #[serde(rename = "newPathname")]
        new_pathname: String,
    },
    /// Operations this service never produces but may read back from a chunk.
    Other(Value),
}

/// File reference inside an add-file operation or a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    /// Content blob hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Tracked changes / comments blob hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges_hash: Option<String>,
    /// Length in chars; present only for editable files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_length: Option<usize>,
    /// Inline content for small editable files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl FileRef {
    /// Editable files carry a length or inline content.
    pub fn is_editable(&self) -> bool {
        self.string_length.is_some() || self.content.is_some()
    }
}

impl Operation {
    /// Path the operation targets, if known.
    pub fn pathname(&self) -> Option<&str> {
        match self {
            Operation::EditText { pathname, .. }
            | Operation::AddFile { pathname, .. }
            | Operation::Rename { pathname, .. } => Some(pathname),
            Operation::Other(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Change, Operation};

    #[test]
    fn operations_decode_by_shape() {
        let change: Change = serde_json::from_str(
            r#"{
                "operations": [
                    {"pathname": "main.tex", "textOperation": [3, "foo", 2]},
                    {"pathname": "x.png", "file": {"hash": "abc"}},
                    {"pathname": "old.tex", "newPathname": ""},
                    {"pathname": "y.png", "metadata": {}}
                ],
                "authors": [],
                "v2Authors": [null],
                "timestamp": "2024-01-01T00:00:00.000Z",
                "projectVersion": "3.0"
            }"#,
        )
        .expect("decode");
        assert!(matches!(change.operations[0], Operation::EditText { .. }));
        assert!(matches!(change.operations[1], Operation::AddFile { .. }));
        assert!(matches!(change.operations[2], Operation::Rename { .. }));
        assert!(matches!(change.operations[3], Operation::Other(_)));
        assert_eq!(change.v2_authors, vec![None]);
    }
}
