//! Chunk store responses and what this service derives from them: the
//! version baseline used for idempotence checks, and the replayed file map
//! used by resync expansion.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    change::{Change, DocVersion, FileRef, Operation},
    clients::ChunkStoreClient,
    error::{HistoryError, HistoryResult},
    text_operation::TextOperation,
    types::DocId,
    version::Version,
};

/// Body of `GET latest/history` and `GET versions/{v}/history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResponse {
    /// The chunk itself.
    pub chunk: RawChunk,
}

/// A chunk: a snapshot and the changes committed on top of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChunk {
    /// Version of the snapshot. Required; absent only in malformed responses.
    #[serde(default)]
    pub start_version: Option<u64>,
    /// Snapshot and changes.
    #[serde(default)]
    pub history: RawHistory,
}

/// History section of a chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawHistory {
    /// State at `start_version`.
    #[serde(default)]
    pub snapshot: RawSnapshot,
    /// Changes after the snapshot, oldest first.
    #[serde(default)]
    pub changes: Vec<Change>,
}

/// Project state at the start of a chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSnapshot {
    /// Files by path.
    #[serde(default)]
    pub files: BTreeMap<String, FileRef>,
    /// Project structure version at the snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_version: Option<Version>,
    /// Document versions at the snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v2_doc_versions: Option<BTreeMap<DocId, DocVersion>>,
}

impl ChunkResponse {
    /// An empty chunk at version zero, as returned for a fresh history.
    pub fn empty() -> Self {
        Self {
            chunk: RawChunk {
                start_version: Some(0),
                history: RawHistory::default(),
            },
        }
    }
}

/// Versions already committed, against which incoming edits are checked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Baseline {
    /// Version the next committed change will take.
    pub version: u64,
    /// Latest project structure version.
    pub project_version: Option<Version>,
    /// Latest version of each document.
    pub doc_versions: BTreeMap<DocId, DocVersion>,
}

/// A baseline plus the first ordering violation found while deriving it.
///
/// Project and doc versions are each derived up to their first regression
/// and no further, so after a violation the baseline is partial. Callers
/// decide whether the violation is fatal.
#[derive(Debug)]
pub struct BaselineReport {
    /// Versions derived so far.
    pub baseline: Baseline,
    /// First regression found, project structure before docs.
    pub ordering_error: Option<HistoryError>,
}

impl Baseline {
    /// Derives the baseline from the most recent chunk.
    pub fn from_chunk(chunk: &RawChunk) -> HistoryResult<BaselineReport> {
        let start_version = chunk
            .start_version
            .ok_or_else(|| HistoryError::UnexpectedResponse("chunk without startVersion".into()))?;
        let changes = &chunk.history.changes;

        let mut ordering_error = None;
        let mut project_version = chunk.history.snapshot.project_version.clone();
        for change in changes {
            let Some(in_change) = &change.project_version else {
                continue;
            };
            if project_version.as_ref().is_some_and(|current| in_change < current) {
                ordering_error = Some(HistoryError::OpsOutOfOrder(
                    "project structure version out of order".to_string(),
                ));
                break;
            }
            project_version = Some(in_change.clone());
        }

        let mut doc_versions = chunk
            .history
            .snapshot
            .v2_doc_versions
            .clone()
            .unwrap_or_default();
        'docs: for change in changes {
            let Some(versions) = &change.v2_doc_versions else {
                continue;
            };
            for (doc_id, in_change) in versions {
                if doc_versions
                    .get(doc_id)
                    .is_some_and(|current| in_change.v < current.v)
                {
                    ordering_error.get_or_insert_with(|| {
                        HistoryError::OpsOutOfOrder("doc version out of order".to_string())
                    });
                    break 'docs;
                }
                doc_versions.insert(doc_id.clone(), in_change.clone());
            }
        }

        Ok(BaselineReport {
            baseline: Baseline {
                version: start_version + changes.len() as u64,
                project_version,
                doc_versions,
            },
            ordering_error,
        })
    }
}

/// One file in the replayed snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotFile {
    /// Reference as of the last add-file.
    pub file: FileRef,
    /// Text operations committed after the file's blob was written.
    pub pending: Vec<TextOperation>,
}

impl SnapshotFile {
    /// A file with no pending operations.
    pub fn new(file: FileRef) -> Self {
        Self {
            file,
            pending: Vec::new(),
        }
    }

    /// Placeholder for a doc that has just been added with no content.
    pub fn empty_doc() -> Self {
        Self::new(FileRef {
            string_length: Some(0),
            content: Some(String::new()),
            ..FileRef::default()
        })
    }

    /// Whether the file is a doc rather than a binary file.
    pub fn is_editable(&self) -> bool {
        self.file.is_editable() || !self.pending.is_empty()
    }

    /// Blob hash, only while no pending operations change the content.
    pub fn hash(&self) -> Option<&str> {
        if self.pending.is_empty() {
            self.file.hash.as_deref()
        } else {
            None
        }
    }

    /// Raw blob hash regardless of pending operations.
    pub fn stored_hash(&self) -> Option<&str> {
        self.file.hash.as_deref()
    }

    /// Current text content: the stored blob with pending operations applied.
    pub async fn load_content(
        &self,
        history_id: &str,
        chunk_store: &dyn ChunkStoreClient,
    ) -> HistoryResult<String> {
        let base = match (&self.file.content, &self.file.hash) {
            (Some(content), _) => content.clone(),
            (None, Some(hash)) => {
                let bytes = chunk_store.get_blob(history_id, hash).await?;
                String::from_utf8(bytes).map_err(|_| {
                    HistoryError::UnexpectedResponse(format!("blob {hash} is not valid UTF-8"))
                })?
            }
            (None, None) => String::new(),
        };
        self.pending
            .iter()
            .try_fold(base, |content, op| op.apply(&content))
    }
}

/// Path-keyed files of the latest snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotFiles {
    files: BTreeMap<String, SnapshotFile>,
}

impl SnapshotFiles {
    /// Replays every change of `chunk` over its start snapshot.
    pub fn from_chunk(chunk: &RawChunk) -> HistoryResult<Self> {
        let mut files: BTreeMap<String, SnapshotFile> = chunk
            .history
            .snapshot
            .files
            .iter()
            .map(|(path, file)| (path.clone(), SnapshotFile::new(file.clone())))
            .collect();

        for change in &chunk.history.changes {
            for operation in &change.operations {
                match operation {
                    Operation::EditText {
                        pathname,
                        text_operation,
                    } => {
                        let file = files.get_mut(pathname).ok_or_else(|| {
                            HistoryError::UnexpectedResponse(format!(
                                "text operation for missing file {pathname}"
                            ))
                        })?;
                        file.pending.push(text_operation.clone());
                    }
                    Operation::AddFile { pathname, file } => {
                        files.insert(pathname.clone(), SnapshotFile::new(file.clone()));
                    }
                    Operation::Rename {
                        pathname,
                        new_pathname,
                    } => {
                        let Some(file) = files.remove(pathname) else {
                            warn!(%pathname, "rename of missing file in chunk");
                            continue;
                        };
                        if !new_pathname.is_empty() {
                            files.insert(new_pathname.clone(), file);
                        }
                    }
                    Operation::Other(_) => {}
                }
            }
        }
        Ok(Self { files })
    }

    /// File at `path`.
    pub fn get(&self, path: &str) -> Option<&SnapshotFile> {
        self.files.get(path)
    }

    /// Adds or replaces the file at `path`.
    pub fn insert(&mut self, path: impl Into<String>, file: SnapshotFile) {
        self.files.insert(path.into(), file);
    }

    /// Files in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &SnapshotFile)> {
        self.files.iter()
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// No files at all.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{Baseline, ChunkResponse, SnapshotFiles};
    use crate::version::Version;

    fn chunk(json: &str) -> ChunkResponse {
        serde_json::from_str(json).expect("chunk")
    }

    #[test]
    fn baseline_takes_latest_versions() {
        let response = chunk(
            r#"{"chunk":{"startVersion":10,"history":{
                "snapshot":{"files":{},"projectVersion":"3.0","v2DocVersions":{"d1":{"pathname":"a.tex","v":4}}},
                "changes":[
                    {"operations":[],"timestamp":"t","projectVersion":"4.0"},
                    {"operations":[],"timestamp":"t","v2DocVersions":{"d1":{"pathname":"a.tex","v":7}}}
                ]}}}"#,
        );
        let report = Baseline::from_chunk(&response.chunk).expect("baseline");
        assert!(report.ordering_error.is_none());
        assert_eq!(report.baseline.version, 12);
        assert_eq!(report.baseline.project_version, Some(Version::from("4.0")));
        assert_eq!(report.baseline.doc_versions["d1"].v, Version::from(7));
    }

    #[test]
    fn project_regression_stops_the_derivation() {
        let response = chunk(
            r#"{"chunk":{"startVersion":0,"history":{"changes":[
                {"operations":[],"timestamp":"t","projectVersion":"5.0"},
                {"operations":[],"timestamp":"t","projectVersion":"4.0"},
                {"operations":[],"timestamp":"t","projectVersion":"6.0"}
            ]}}}"#,
        );
        let report = Baseline::from_chunk(&response.chunk).expect("baseline");
        assert_eq!(
            report.ordering_error.map(|e| e.to_string()),
            Some("project structure version out of order".to_string())
        );
        assert_eq!(report.baseline.version, 3);
        assert_eq!(report.baseline.project_version, Some(Version::from("5.0")));
    }

    #[test]
    fn both_regressions_keep_partial_versions() {
        let response = chunk(
            r#"{"chunk":{"startVersion":5,"history":{
                "snapshot":{"files":{},"projectVersion":"1"},
                "changes":[
                    {"operations":[],"timestamp":"t","projectVersion":"2"},
                    {"operations":[],"timestamp":"t","projectVersion":"3"},
                    {"operations":[],"timestamp":"t","projectVersion":"1"},
                    {"operations":[],"timestamp":"t","v2DocVersions":{"d1":{"pathname":"/main.tex","v":2}}},
                    {"operations":[],"timestamp":"t","v2DocVersions":{"d1":{"pathname":"/main.tex","v":1}}},
                    {"operations":[],"timestamp":"t","v2DocVersions":{"d1":{"pathname":"/main.tex","v":4}}}
                ]}}}"#,
        );
        let report = Baseline::from_chunk(&response.chunk).expect("baseline");
        assert_eq!(
            report.ordering_error.map(|e| e.to_string()),
            Some("project structure version out of order".to_string())
        );
        assert_eq!(report.baseline.version, 11);
        assert_eq!(report.baseline.project_version, Some(Version::from("3")));
        assert_eq!(report.baseline.doc_versions["d1"].v, Version::from(2));
    }

    #[test]
    fn doc_regression_alone_is_reported() {
        let response = chunk(
            r#"{"chunk":{"startVersion":5,"history":{
                "snapshot":{"files":{},"v2DocVersions":{"d1":{"pathname":"/main.tex","v":2}}},
                "changes":[
                    {"operations":[],"timestamp":"t","v2DocVersions":{"d1":{"pathname":"/main.tex","v":1}}}
                ]}}}"#,
        );
        let report = Baseline::from_chunk(&response.chunk).expect("baseline");
        assert_eq!(
            report.ordering_error.map(|e| e.to_string()),
            Some("doc version out of order".to_string())
        );
        assert_eq!(report.baseline.version, 6);
        assert_eq!(report.baseline.doc_versions["d1"].v, Version::from(2));
    }

    #[test]
    fn missing_start_version_is_unexpected() {
        let response = chunk(r#"{"chunk":{"history":{"changes":[]}}}"#);
        let err = Baseline::from_chunk(&response.chunk).expect_err("must fail");
        assert!(err.to_string().starts_with("unexpected response"));
    }

    #[test]
    fn replay_tracks_renames_and_pending_edits() {
        let response = chunk(
            r#"{"chunk":{"startVersion":0,"history":{
                "snapshot":{"files":{"a.tex":{"hash":"h1","stringLength":3},"x.png":{"hash":"h2"}}},
                "changes":[
                    {"operations":[{"pathname":"a.tex","textOperation":[3,"!"]}],"timestamp":"t"},
                    {"operations":[{"pathname":"x.png","newPathname":"img/x.png"}],"timestamp":"t"},
                    {"operations":[{"pathname":"b.tex","newPathname":""}],"timestamp":"t"}
                ]}}}"#,
        );
        let files = SnapshotFiles::from_chunk(&response.chunk).expect("replay");
        assert_eq!(files.len(), 2);
        let doc = files.get("a.tex").expect("a.tex");
        assert!(doc.is_editable());
        assert_eq!(doc.hash(), None);
        assert_eq!(doc.stored_hash(), Some("h1"));
        let image = files.get("img/x.png").expect("moved");
        assert!(!image.is_editable());
        assert_eq!(image.hash(), Some("h2"));
    }
}
