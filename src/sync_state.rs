//! Per-project resync state machine and its persisted record.
//!
//! A project is idle, syncing its structure, or syncing the content of a set
//! of document paths. Structure and doc-content syncing never overlap: a
//! structure resync edit ends the structure phase and opens one doc-content
//! phase per expected doc, and each doc-content resync edit closes one path.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{HistoryError, HistoryResult},
    types::{Origin, ProjectId},
    update::{EditKind, RawEdit},
};

/// Entries kept in [`SyncStateRecord::history`].
pub const MAX_RESYNC_HISTORY_RECORDS: usize = 100;
/// Completed sync records expire this long after their last update.
pub const RESYNC_HISTORY_EXPIRY_DAYS: i64 = 90;

/// Where a project is in its resync. The default is idle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Waiting for the structure resync edit.
    #[serde(default)]
    pub resync_project_structure: bool,
    /// Unnormalized doc paths still waiting for a content resync.
    #[serde(default)]
    pub resync_doc_contents: BTreeSet<String>,
    /// Origin stamped on the changes the resync produces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

impl SyncState {
    /// Advances the state for one incoming edit, rejecting resync edits the
    /// current state does not expect.
    pub fn update_state(&mut self, edit: &RawEdit) -> HistoryResult<()> {
        match &edit.kind {
            EditKind::ResyncProjectStructure {
                structure,
                structure_only,
            } => {
                if !self.is_project_structure_syncing() {
                    return Err(HistoryError::sync("unexpected resyncProjectStructure update"));
                }
                if self.is_any_doc_content_syncing() {
                    return Err(HistoryError::sync("unexpected resyncDocContents update"));
                }
                if !structure_only {
                    for doc in &structure.docs {
                        self.start_doc_content_sync(&doc.path);
                    }
                }
                self.stop_project_structure_sync();
            }
            EditKind::ResyncDocContent { path, .. } => {
                if self.is_project_structure_syncing() {
                    return Err(HistoryError::sync_for_path(
                        "unexpected resyncDocContent update",
                        path.clone(),
                    ));
                }
                if !self.is_doc_content_syncing(path) {
                    return Err(HistoryError::sync_for_path(
                        "unexpected resyncDocContent update",
                        path.clone(),
                    ));
                }
                self.stop_doc_content_sync(path);
            }
            _ => {}
        }
        Ok(())
    }

    /// Ordinary edits are skipped while the structure syncs, and text edits
    /// are skipped for docs whose content is syncing. Resync edits never are.
    pub fn should_skip_update(&self, edit: &RawEdit) -> bool {
        if edit.is_resync_structure() || edit.is_resync_doc_content() {
            return false;
        }
        if self.is_project_structure_syncing() {
            return true;
        }
        edit.is_text()
            && edit
                .meta
                .pathname
                .as_deref()
                .is_some_and(|path| self.is_doc_content_syncing(path))
    }

    /// Sets the origin for the changes of this sync.
    pub fn set_origin(&mut self, origin: Origin) {
        self.origin = Some(origin);
    }

    /// Enters the structure phase, dropping any pending doc paths.
    pub fn start_project_structure_sync(&mut self) {
        self.resync_project_structure = true;
        self.resync_doc_contents.clear();
    }

    /// Leaves the structure phase.
    pub fn stop_project_structure_sync(&mut self) {
        self.resync_project_structure = false;
    }

    /// Waits for a content resync of `path`.
    pub fn start_doc_content_sync(&mut self, path: &str) {
        self.resync_doc_contents.insert(path.to_string());
    }

    /// Stops waiting for `path`.
    pub fn stop_doc_content_sync(&mut self, path: &str) {
        self.resync_doc_contents.remove(path);
    }

    /// In the structure phase.
    pub fn is_project_structure_syncing(&self) -> bool {
        self.resync_project_structure
    }

    /// Waiting for a content resync of `path`.
    pub fn is_doc_content_syncing(&self, path: &str) -> bool {
        self.resync_doc_contents.contains(path)
    }

    /// Waiting for at least one doc.
    pub fn is_any_doc_content_syncing(&self) -> bool {
        !self.resync_doc_contents.is_empty()
    }

    /// Any phase is open.
    pub fn is_sync_ongoing(&self) -> bool {
        self.is_project_structure_syncing() || self.is_any_doc_content_syncing()
    }
}

/// A past state and when it was stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateHistoryEntry {
    /// State stored.
    pub sync_state: SyncState,
    /// When it was stored.
    pub timestamp: DateTime<Utc>,
}

/// Stored form of a project's [`SyncState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateRecord {
    /// Project the record belongs to.
    pub project_id: ProjectId,
    /// Current state.
    #[serde(flatten)]
    pub state: SyncState,
    /// Previous states, newest first.
    #[serde(default)]
    pub history: Vec<SyncStateHistoryEntry>,
    /// Number of syncs started.
    #[serde(default)]
    pub resync_count: u64,
    /// Time of the last write.
    pub last_updated: DateTime<Utc>,
    /// Unset while a sync is ongoing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SyncStateRecord {
    /// Record after storing `state` over `previous`.
    ///
    /// Starting a sync bumps `resync_count` and clears the expiry; a state with
    /// nothing ongoing expires after [`RESYNC_HISTORY_EXPIRY_DAYS`].
    pub fn next(
        previous: Option<SyncStateRecord>,
        project_id: &str,
        state: SyncState,
        now: DateTime<Utc>,
    ) -> SyncStateRecord {
        let (mut history, mut resync_count) = previous
            .map(|record| (record.history, record.resync_count))
            .unwrap_or_default();
        history.insert(
            0,
            SyncStateHistoryEntry {
                sync_state: state.clone(),
                timestamp: now,
            },
        );
        history.truncate(MAX_RESYNC_HISTORY_RECORDS);

        let expires_at = if state.is_sync_ongoing() {
            resync_count += 1;
            None
        } else {
            Some(now + ChronoDuration::days(RESYNC_HISTORY_EXPIRY_DAYS))
        };

        SyncStateRecord {
            project_id: project_id.to_string(),
            state,
            history,
            resync_count,
            last_updated: now,
            expires_at,
        }
    }

    /// Past its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{MAX_RESYNC_HISTORY_RECORDS, SyncState, SyncStateRecord};
    use crate::update::RawEdit;

    fn structure_edit(only: bool) -> RawEdit {
        RawEdit::parse(&format!(
            r#"{{"resyncProjectStructure":{{"docs":[{{"doc":"d1","path":"/main.tex"}}],"files":[]}},
                "resyncProjectStructureOnly":{only},"meta":{{"ts":1}}}}"#
        ))
        .expect("structure edit")
    }

    fn content_edit(path: &str) -> RawEdit {
        RawEdit::parse(&format!(
            r#"{{"resyncDocContent":{{"content":"x"}},"path":"{path}","doc":"d1","meta":{{"ts":1}}}}"#
        ))
        .expect("content edit")
    }

    #[test]
    fn structure_then_content_returns_to_idle() {
        let mut state = SyncState::default();
        state.start_project_structure_sync();

        let text = RawEdit::parse(
            r#"{"doc":"d1","op":[{"p":0,"i":"a"}],"meta":{"ts":1,"pathname":"/main.tex","doc_length":0}}"#,
        )
        .expect("text");
        assert!(state.should_skip_update(&text));

        state.update_state(&structure_edit(false)).expect("structure");
        assert!(!state.is_project_structure_syncing());
        assert!(state.is_doc_content_syncing("/main.tex"));
        assert!(state.should_skip_update(&text));

        state.update_state(&content_edit("/main.tex")).expect("content");
        assert!(!state.is_sync_ongoing());
        assert!(!state.should_skip_update(&text));
    }

    #[test]
    fn unexpected_resync_edits_are_rejected() {
        let mut idle = SyncState::default();
        let err = idle
            .update_state(&structure_edit(false))
            .expect_err("not syncing");
        assert_eq!(err.to_string(), "unexpected resyncProjectStructure update");

        let mut syncing = SyncState::default();
        syncing.start_project_structure_sync();
        let err = syncing
            .update_state(&content_edit("/main.tex"))
            .expect_err("structure first");
        assert_eq!(err.to_string(), "unexpected resyncDocContent update");
    }

    #[test]
    fn structure_only_skips_doc_phase() {
        let mut state = SyncState::default();
        state.start_project_structure_sync();
        state.update_state(&structure_edit(true)).expect("structure");
        assert!(!state.is_sync_ongoing());
    }

    #[test]
    fn record_keeps_bounded_history_and_expiry() {
        let now = Utc::now();
        let mut ongoing = SyncState::default();
        ongoing.start_project_structure_sync();

        let mut record = SyncStateRecord::next(None, "p1", ongoing.clone(), now);
        assert_eq!(record.resync_count, 1);
        assert!(record.expires_at.is_none());

        for _ in 0..MAX_RESYNC_HISTORY_RECORDS + 5 {
            record = SyncStateRecord::next(Some(record), "p1", SyncState::default(), now);
        }
        assert_eq!(record.history.len(), MAX_RESYNC_HISTORY_RECORDS);
        assert_eq!(record.resync_count, 1);
        assert!(record.expires_at.is_some_and(|at| at > now));
    }
}
