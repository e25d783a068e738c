//! State Store
//!
//! Single observable container of everything the editor shows for the active
//! page. Writers hand an updater to [`CanvasStore::set_state`], which applies
//! it to a private copy and swaps the result in atomically, so readers only
//! ever observe fully formed states.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::diff::SnapshotEnvelope;
use crate::error::CanvasError;
use crate::model::{CanvasSnapshot, HistoryEntry, Page, ReviewStatus, Section};

/// Everything the editor shows for the active page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanvasState {
    /// Active page
    pub page_id: Option<Uuid>,
    /// Page fields of the active page
    pub page: Option<Page>,
    /// Live sections
    pub sections: Vec<Section>,
    /// Last committed snapshot
    pub snapshot: Option<CanvasSnapshot>,
    /// Last confirmed envelopes, keyed by section id
    pub baseline: BTreeMap<Uuid, SnapshotEnvelope>,
    /// Version of the baseline record
    pub baseline_version: u64,
    /// Sections differing from the baseline, optimistic or conflicted
    pub dirty_section_ids: BTreeSet<Uuid>,
    /// Reviewer verdicts received on the sync channel
    pub review_statuses: BTreeMap<Uuid, ReviewStatus>,
    /// A sections fetch is running
    pub is_loading: bool,
    /// Number of mutations awaiting the server
    pub pending_mutations: u32,
    /// A publish is running
    pub is_publishing: bool,
    /// Last failure
    pub error: Option<CanvasError>,
    /// Page concurrency token
    pub page_etag: Option<String>,
    /// Sections concurrency token
    pub sections_etag: Option<String>,
    /// Content change log, newest first
    pub history: Vec<HistoryEntry>,
    /// History concurrency token
    pub history_etag: Option<String>,
    /// Sections showing an unconfirmed local edit
    pub optimistic_section_ids: BTreeSet<Uuid>,
    /// Sections whose last mutation was rejected on a stale token
    pub conflict_section_ids: BTreeSet<Uuid>,
    /// Last successful sections fetch
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// Last successful history fetch
    pub last_history_fetched_at: Option<DateTime<Utc>>,
    /// Last time the store was confirmed current with the server
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Revisions produced by this instance's accepted edits since the baseline
    pub local_revisions: BTreeMap<Uuid, LocalRevision>,
}

/// A run of consecutive accepted edits of one section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRevision {
    /// Token the first edit of the run was sent against
    pub base_etag: String,
    /// Token returned for the latest edit
    pub head_etag: String,
}

impl CanvasState {
    /// A mutation is awaiting the server
    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.pending_mutations > 0
    }

    /// Get a live section by ID
    #[must_use]
    pub fn section(&self, section_id: Uuid) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == section_id)
    }

    /// Check if a section has unpublished or unconfirmed changes
    #[must_use]
    pub fn is_dirty(&self, section_id: Uuid) -> bool {
        self.dirty_section_ids.contains(&section_id)
    }

    /// Check if `page_id` is the active page
    #[must_use]
    pub fn is_active(&self, page_id: Uuid) -> bool {
        self.page_id == Some(page_id)
    }

    /// Replace the live sections and keep the snapshot in step
    pub fn replace_snapshot(&mut self, snapshot: CanvasSnapshot) {
        self.page = Some(snapshot.page.clone());
        self.sections = snapshot.sections.clone();
        self.snapshot = Some(snapshot);
    }

    /// Record an accepted edit sent against `based_on` that produced `head`.
    ///
    /// An edit based on the head of the current run extends it; any other
    /// edit starts a new run.
    pub fn record_local_revision(
        &mut self,
        section_id: Uuid,
        based_on: Option<&str>,
        head: Option<&str>,
    ) {
        let (Some(based_on), Some(head)) = (based_on, head) else {
            self.local_revisions.remove(&section_id);
            return;
        };
        let base_etag = match self.local_revisions.get(&section_id) {
            Some(run) if run.head_etag == based_on => run.base_etag.clone(),
            _ => based_on.to_string(),
        };
        self.local_revisions.insert(
            section_id,
            LocalRevision {
                base_etag,
                head_etag: head.to_string(),
            },
        );
    }

    /// Token the local edits leading to `section` started from, when
    /// `section` is still the latest revision this instance produced
    #[must_use]
    pub fn local_origin(&self, section: &Section) -> Option<&str> {
        let run = self.local_revisions.get(&section.id)?;
        let is_head = section.etag.as_deref() == Some(run.head_etag.as_str());
        is_head.then_some(run.base_etag.as_str())
    }

    /// Clear everything that belongs to the active page
    pub fn clear_page(&mut self) {
        *self = Self {
            pending_mutations: self.pending_mutations,
            ..Self::default()
        };
    }
}

/// Observable single-writer store
#[derive(Debug)]
pub struct CanvasStore {
    sender: watch::Sender<Arc<CanvasState>>,
}

impl Default for CanvasStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasStore {
    /// Create a store holding the initial state
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Arc::new(CanvasState::default()));
        Self { sender }
    }

    /// Current state
    #[must_use]
    pub fn get_state(&self) -> Arc<CanvasState> {
        Arc::clone(&self.sender.borrow())
    }

    /// Receiver notified after every transition; dropping it unsubscribes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<CanvasState>> {
        self.sender.subscribe()
    }

    /// Apply `updater` to a copy of the current state and publish the result
    pub fn set_state(&self, updater: impl FnOnce(&mut CanvasState)) {
        self.sender.send_modify(|current| {
            let mut next = CanvasState::clone(current);
            updater(&mut next);
            *current = Arc::new(next);
        });
    }

    /// Restore the initial state. Mutations still awaiting the server stay
    /// counted until they finish.
    pub fn reset(&self) {
        self.sender.send_modify(|current| {
            *current = Arc::new(CanvasState {
                pending_mutations: current.pending_mutations,
                ..CanvasState::default()
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_state_swaps_whole_value() {
        let store = CanvasStore::new();
        let before = store.get_state();

        store.set_state(|state| {
            state.is_loading = true;
            state.page_id = Some(Uuid::nil());
        });

        let after = store.get_state();
        assert!(!before.is_loading);
        assert!(after.is_loading);
        assert!(after.is_active(Uuid::nil()));
    }

    #[tokio::test]
    async fn test_subscribers_see_complete_transitions() {
        let store = CanvasStore::new();
        let mut rx = store.subscribe();

        store.set_state(|state| {
            state.pending_mutations += 1;
            state.optimistic_section_ids.insert(Uuid::nil());
        });

        rx.changed().await.unwrap();
        let seen = rx.borrow_and_update().clone();
        assert!(seen.is_saving());
        assert!(seen.optimistic_section_ids.contains(&Uuid::nil()));
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let store = CanvasStore::new();
        store.set_state(|state| {
            state.sections_etag = Some("\"s1\"".to_string());
            state.is_publishing = true;
        });

        store.reset();
        assert_eq!(*store.get_state(), CanvasState::default());
    }

    #[test]
    fn test_reset_keeps_pending_mutations() {
        let store = CanvasStore::new();
        store.set_state(|state| {
            state.page_id = Some(Uuid::nil());
            state.pending_mutations = 1;
        });

        store.reset();
        let state = store.get_state();
        assert_eq!(state.page_id, None);
        assert!(state.is_saving());
    }

    #[test]
    fn test_local_revisions_chain() {
        let id = Uuid::from_u128(1);
        let mut state = CanvasState::default();
        state.record_local_revision(id, Some("v1"), Some("v2"));
        state.record_local_revision(id, Some("v2"), Some("v3"));

        let run = &state.local_revisions[&id];
        assert_eq!(run.base_etag, "v1");
        assert_eq!(run.head_etag, "v3");

        // Based on a revision someone else wrote: a new run starts
        state.record_local_revision(id, Some("v5"), Some("v6"));
        assert_eq!(state.local_revisions[&id].base_etag, "v5");

        state.record_local_revision(id, Some("v6"), None);
        assert!(state.local_revisions.is_empty());
    }

    #[test]
    fn test_clear_page_keeps_pending_mutations() {
        let mut state = CanvasState {
            page_id: Some(Uuid::nil()),
            pending_mutations: 2,
            ..CanvasState::default()
        };
        state.clear_page();
        assert_eq!(state.page_id, None);
        assert_eq!(state.pending_mutations, 2);
    }
}
