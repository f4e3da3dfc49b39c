//! Error type shared by every module, and the message classification the
//! retry sweep relies on.

use thiserror::Error;

/// Every failure the ingestion core can surface.
///
/// Variants are grouped the way the retry sweep treats them: transient
/// infrastructure failures, consistency failures that need a resync, and
/// format failures that point at an upstream producer bug.
#[derive(Error, Debug)]
pub enum HistoryError {
    // transient
    /// A request timed out; carries the URL or service name.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A request failed before a response arrived.
    #[error("request to {url} failed: {message}")]
    Request {
        /// Request URL.
        url: String,
        /// Transport error text.
        message: String,
    },

    /// A collaborator answered with a non-2xx status.
    #[error("{service} returned a non-success status code: {status}")]
    HttpStatus {
        /// Collaborator name, as it appears in the message.
        service: &'static str,
        /// HTTP status.
        status: u16,
        /// Request URL.
        url: String,
    },

    /// The project lock could not be taken in time.
    #[error("timeout acquiring lock {key}")]
    LockTimeout {
        /// Lock key.
        key: String,
    },

    /// The lease was lost or had already expired when extended.
    #[error("failed to extend lock {key}")]
    LockExtend {
        /// Lock key.
        key: String,
    },

    /// The lease had expired by the time it was released.
    #[error("tried to release timed out lock {key}")]
    LockRelease {
        /// Lock key.
        key: String,
    },

    // consistency
    /// Versions went backwards, in the queue or in committed history.
    #[error("{0}")]
    OpsOutOfOrder(String),

    /// A resync edit arrived in a state that cannot accept it.
    #[error("{message}")]
    Sync {
        /// Fixed description of the problem.
        message: &'static str,
        /// Doc path, for doc content resyncs.
        path: Option<String>,
    },

    /// A resync is already running for the project.
    #[error("sync ongoing")]
    SyncOngoing,

    /// A structure-only resync turned out to touch a doc.
    #[error("aborting partial resync: touched doc")]
    NeedFullProjectStructureResync,

    /// Queued edits name different history ids.
    #[error("inconsistent project history id between updates ({first} != {second})")]
    InconsistentHistoryId {
        /// Id on the first edit.
        first: String,
        /// First id that disagrees.
        second: String,
    },

    /// Queued edits and the metadata service disagree on the history id.
    #[error("inconsistent project history id between updates and metadata service")]
    HistoryIdMismatch {
        /// Id carried by the edits.
        from_updates: String,
        /// Id the metadata service returned.
        from_metadata: String,
    },

    /// A doc content resync names a path the snapshot does not have.
    #[error("unrecognised file: not in snapshot ({path})")]
    UnknownSnapshotFile {
        /// Path from the resync edit.
        path: String,
    },

    /// A collaborator answered with a body this service cannot use.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// A retried project still has a failure record.
    #[error("failure record still present after retry")]
    FailureRecordNotCleared,

    /// Edits were left in the queue after a hard retry drained it.
    #[error("queue not drained after resync ({remaining} updates remain)")]
    QueueNotDrained {
        /// Edits still queued.
        remaining: usize,
    },

    // format
    /// A queued edit matches none of the known shapes.
    #[error("update with unknown format")]
    UnknownUpdateFormat,

    /// A text op of an unknown kind.
    #[error("unexpected op type")]
    UnexpectedOpType,

    /// A path that is empty once normalized.
    #[error("invalid pathname: {0:?}")]
    InvalidPathname(String),

    /// A missing or unparseable file URL.
    #[error("invalid file url: {0}")]
    InvalidFileUrl(String),

    /// A text edit that cannot be turned into a text operation.
    #[error("invalid text operation: {0}")]
    InvalidTextOperation(String),

    // storage and plumbing
    /// SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Any other backend failure.
    #[error("store error: {0}")]
    Store(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Another error tagged with the pipeline step it came from. Displays as
    /// the wrapped error.
    #[error("{source}")]
    Contextual {
        /// Pipeline step.
        step: &'static str,
        /// Project being processed.
        project_id: String,
        /// History id, once known.
        history_id: Option<String>,
        /// Wrapped error.
        #[source]
        source: Box<HistoryError>,
    },
}

/// Result alias used throughout the crate.
pub type HistoryResult<T> = Result<T, HistoryError>;

impl HistoryError {
    /// A [`HistoryError::Sync`] with no path.
    pub fn sync(message: &'static str) -> Self {
        Self::Sync {
            message,
            path: None,
        }
    }

    /// A [`HistoryError::Sync`] for one doc.
    pub fn sync_for_path(message: &'static str, path: impl Into<String>) -> Self {
        Self::Sync {
            message,
            path: Some(path.into()),
        }
    }

    /// Wraps a backend error as [`HistoryError::Store`].
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }

    /// Maps a reqwest error, keeping timeouts distinct.
    pub fn request(url: impl Into<String>, err: reqwest::Error) -> Self {
        let url = url.into();
        if err.is_timeout() {
            Self::Timeout(url)
        } else {
            Self::Request {
                url,
                message: err.to_string(),
            }
        }
    }

    /// Strips any context wrappers.
    pub fn root(&self) -> &HistoryError {
        let mut current = self;
        while let HistoryError::Contextual { source, .. } = current {
            current = source;
        }
        current
    }

    /// Whether the root error is [`HistoryError::OpsOutOfOrder`].
    pub fn is_ops_out_of_order(&self) -> bool {
        matches!(self.root(), HistoryError::OpsOutOfOrder(_))
    }

    /// Infrastructure failure expected to clear up on its own.
    pub fn is_temporary(&self) -> bool {
        is_temporary_message(&self.to_string())
    }

    /// Failure that needs a resync rather than a replay.
    pub fn is_hard(&self) -> bool {
        self.is_ops_out_of_order() || is_hard_message(&self.to_string())
    }

    /// Context frames from outermost to innermost followed by the root
    /// message, one per line. Persisted as the failure "stack".
    pub fn trace(&self) -> String {
        let mut lines = Vec::new();
        let mut current = self;
        while let HistoryError::Contextual {
            step,
            project_id,
            history_id,
            source,
        } = current
        {
            match history_id {
                Some(history_id) => lines.push(format!(
                    "at {step} (project_id={project_id}, history_id={history_id})"
                )),
                None => lines.push(format!("at {step} (project_id={project_id})")),
            }
            current = source;
        }
        lines.insert(0, current.to_string());
        lines.join("\n")
    }
}

const TEMPORARY_MARKERS: [&str; 6] = [
    "timeout",
    "timed out",
    "no space left",
    "lock exceeded",
    "failed to extend lock",
    "tried to release timed out lock",
];

const HARD_MARKERS: [&str; 2] = ["status code: 422", "out of order"];

/// Classifies a persisted error message as temporary. Matching is a
/// case-insensitive substring test so records written by older versions
/// still classify.
pub fn is_temporary_message(message: &str) -> bool {
    let message = message.to_lowercase();
    TEMPORARY_MARKERS.iter().any(|marker| message.contains(marker))
}

/// Classifies a persisted error message as hard.
pub fn is_hard_message(message: &str) -> bool {
    let message = message.to_lowercase();
    HARD_MARKERS.iter().any(|marker| message.contains(marker))
}

/// Tags errors with the pipeline step and identifiers as they propagate.
pub trait ResultExt<T> {
    /// Wraps the error with the step and project id.
    fn context(self, step: &'static str, project_id: &str) -> HistoryResult<T>;

    /// Like [`ResultExt::context`], with the history id as well.
    fn history_context(
        self,
        step: &'static str,
        project_id: &str,
        history_id: &str,
    ) -> HistoryResult<T>;
}

impl<T> ResultExt<T> for HistoryResult<T> {
    fn context(self, step: &'static str, project_id: &str) -> HistoryResult<T> {
        self.map_err(|source| HistoryError::Contextual {
            step,
            project_id: project_id.to_string(),
            history_id: None,
            source: Box::new(source),
        })
    }

    fn history_context(
        self,
        step: &'static str,
        project_id: &str,
        history_id: &str,
    ) -> HistoryResult<T> {
        self.map_err(|source| HistoryError::Contextual {
            step,
            project_id: project_id.to_string(),
            history_id: Some(history_id.to_string()),
            source: Box::new(source),
        })
    }
}

impl From<tokio::task::JoinError> for HistoryError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Store(format!("blocking task failed: {value}"))
    }
}
