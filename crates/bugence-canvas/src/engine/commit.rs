use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uuid::Uuid;

use super::CanvasEngine;
use crate::bus::{SectionChangedPayload, SnapshotAppliedPayload, SnapshotSource, SyncEvent};
use crate::diff::{
    capture_all, diff_envelope_sets, diff_snapshots, DiffOptions, SnapshotDiff, SnapshotEnvelope,
};
use crate::error::{Error, Result};
use crate::events::{CanvasEvent, CanvasEventType};
use crate::model::{CanvasSnapshot, Section};
use crate::store::CanvasState;

/// Ids of sections whose hash differs from (or is missing in) the baseline
fn hash_dirty_ids(
    current: &[SnapshotEnvelope],
    baseline: &BTreeMap<Uuid, SnapshotEnvelope>,
) -> BTreeSet<Uuid> {
    current
        .iter()
        .filter(|envelope| {
            baseline
                .get(&envelope.section_id)
                .is_none_or(|prior| prior.content_hash != envelope.content_hash)
        })
        .map(|envelope| envelope.section_id)
        .collect()
}

/// Envelope of `section`, carrying the token its local edits started from
pub(super) fn tracked_envelope(
    page_id: Uuid,
    section: &Section,
    state: &CanvasState,
) -> SnapshotEnvelope {
    let envelope = SnapshotEnvelope::capture(page_id, section);
    match state.local_origin(section) {
        Some(base) => envelope.with_base_etag(base),
        None => envelope,
    }
}

/// Envelopes of every live section, for conflict-aware comparison
pub(super) fn tracked_envelopes(page_id: Uuid, state: &CanvasState) -> Vec<SnapshotEnvelope> {
    state
        .sections
        .iter()
        .map(|section| tracked_envelope(page_id, section, state))
        .collect()
}

/// Snapshot of the live store content, for mutations to build on
pub(super) fn live_snapshot(state: &CanvasState) -> Option<CanvasSnapshot> {
    match (&state.snapshot, &state.page) {
        (Some(snapshot), _) => Some(snapshot.clone()),
        (None, Some(page)) => Some(CanvasSnapshot::new(page.clone(), state.sections.clone())),
        (None, None) => None,
    }
}

impl CanvasEngine {
    /// Apply a snapshot to the store.
    ///
    /// `partial` runs inside the same transition. The baseline is replaced
    /// with `snapshot` when `reset_baseline` is `Some(true)`, or when it is
    /// `None`, the snapshot comes from the server and no baseline exists yet.
    /// Fails with `Superseded` when the snapshot's page is not the active page.
    pub(crate) async fn commit_snapshot<F>(
        &self,
        snapshot: CanvasSnapshot,
        source: SnapshotSource,
        partial: F,
        reset_baseline: Option<bool>,
    ) -> Result<SnapshotDiff>
    where
        F: FnOnce(&mut CanvasState) + Send,
    {
        let _commit = self.inner.commit_lock.lock().await;

        let page_id = snapshot.page.id;
        let previous = self.state();
        if !previous.is_active(page_id) {
            return Err(Error::Superseded(page_id));
        }

        let diff = diff_snapshots(previous.snapshot.as_ref(), &snapshot);
        let (baseline_before, version_before) = self.resolve_baseline(page_id, &previous).await;

        let current = capture_all(page_id, &snapshot.sections);
        let reset = reset_baseline
            .unwrap_or(source == SnapshotSource::Remote && baseline_before.is_empty());
        let (baseline_after, version_after) = if reset {
            let record = self
                .inner
                .baseline
                .save(page_id, current.clone(), version_before + 1)
                .await;
            debug!(page_id = %page_id, version = record.version, "Baseline reset");
            (record.snapshots, record.version)
        } else {
            (baseline_before.clone(), version_before)
        };

        let hash_dirty = hash_dirty_ids(&current, &baseline_after);
        let committed = snapshot.clone();
        self.inner.store.set_state(move |state| {
            partial(state);
            state.replace_snapshot(committed);
            state.baseline = baseline_after;
            state.baseline_version = version_after;
            if reset {
                state.local_revisions.clear();
            }
            state.dirty_section_ids = hash_dirty
                .into_iter()
                .chain(state.optimistic_section_ids.iter().copied())
                .chain(state.conflict_section_ids.iter().copied())
                .collect();
        });

        let tracked = tracked_envelopes(page_id, &self.state());
        self.announce(page_id, source, &diff, &current, &tracked, &baseline_before);

        debug!(
            page_id = %page_id,
            source = ?source,
            added = diff.added.len(),
            updated = diff.updated.len(),
            removed = diff.removed.len(),
            "Snapshot committed"
        );
        Ok(diff)
    }

    /// Baseline of the page: store first, then the cache tiers
    async fn resolve_baseline(
        &self,
        page_id: Uuid,
        state: &CanvasState,
    ) -> (BTreeMap<Uuid, SnapshotEnvelope>, u64) {
        if state.is_active(page_id) && !state.baseline.is_empty() {
            return (state.baseline.clone(), state.baseline_version);
        }
        match self.inner.baseline.load(page_id).await {
            Some(record) => (record.snapshots, record.version),
            None => (BTreeMap::new(), 0),
        }
    }

    fn announce(
        &self,
        page_id: Uuid,
        source: SnapshotSource,
        diff: &SnapshotDiff,
        current: &[SnapshotEnvelope],
        tracked: &[SnapshotEnvelope],
        baseline_before: &BTreeMap<Uuid, SnapshotEnvelope>,
    ) {
        self.emit(CanvasEvent::new(CanvasEventType::SnapshotApplied, page_id));
        let section_event = |event_type, section: &Section| {
            CanvasEvent::new(event_type, page_id).with_section(section.clone())
        };
        for section in &diff.added {
            self.emit(section_event(CanvasEventType::SectionAdded, section));
        }
        for change in &diff.updated {
            self.emit(section_event(CanvasEventType::SectionUpdated, &change.next));
        }
        for section in &diff.removed {
            self.emit(section_event(CanvasEventType::SectionRemoved, section));
        }

        self.inner
            .bus
            .publish(SyncEvent::SnapshotApplied(SnapshotAppliedPayload {
                page_id,
                snapshot: current.to_vec(),
                source,
                applied_at: Utc::now(),
            }));

        let dirty = self.state().dirty_section_ids.clone();
        for envelope in diff_envelope_sets(
            baseline_before.values(),
            tracked,
            DiffOptions::detecting_conflicts(),
        ) {
            self.inner
                .bus
                .publish(SyncEvent::SectionChanged(SectionChangedPayload {
                    page_id,
                    section_id: envelope.section_id,
                    dirty: dirty.contains(&envelope.section_id),
                    diff: Some(envelope),
                }));
        }
    }
}
