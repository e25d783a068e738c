use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::{canvas_error, CanvasEngine};
use crate::api::Fetched;
use crate::bus::SnapshotSource;
use crate::diff::SnapshotDiff;
use crate::error::{Error, Result};
use crate::model::{CanvasSnapshot, HistoryEntry, SectionsResponse};
use crate::store::CanvasState;

/// Options for foreground loads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Reload even when a load is running, replace the baseline with the
    /// fetched snapshot and refetch history
    pub force: bool,
}

impl LoadOptions {
    /// Forced load
    #[must_use]
    pub fn forced() -> Self {
        Self { force: true }
    }
}

impl CanvasEngine {
    /// Load sections and history of a page and return the resulting state
    pub async fn load(&self, page_id: Uuid, options: LoadOptions) -> Result<Arc<CanvasState>> {
        self.load_sections(page_id, options).await?;
        self.load_history(page_id, options.force).await;
        Ok(self.state())
    }

    /// Fetch the sections of a page and commit them as a remote snapshot.
    ///
    /// Returns `None` when a load of the same page is already running and
    /// `options.force` is not set. Switching to another page clears all state
    /// of the previous one first.
    pub async fn load_sections(
        &self,
        page_id: Uuid,
        options: LoadOptions,
    ) -> Result<Option<SnapshotDiff>> {
        let state = self.state();
        if state.is_loading && !options.force && state.is_active(page_id) {
            return Ok(None);
        }

        self.inner.store.set_state(|state| {
            if !state.is_active(page_id) {
                state.clear_page();
                state.page_id = Some(page_id);
            }
            state.is_loading = true;
            state.error = None;
        });

        let result = self.inner.api.fetch_sections(page_id, None).await;
        self.ensure_active(page_id)?;

        match result {
            Ok(Fetched::Modified { data, etag }) => {
                let diff = self.apply_sections(data, etag, options).await?;
                self.ensure_sync_worker(page_id);
                info!(
                    page_id = %page_id,
                    sections = self.state().sections.len(),
                    "Canvas sections loaded"
                );
                Ok(Some(diff))
            }
            Ok(Fetched::NotModified) => {
                let now = Utc::now();
                self.inner.store.set_state(|state| {
                    state.is_loading = false;
                    state.last_synced_at = Some(now);
                });
                self.ensure_sync_worker(page_id);
                Ok(None)
            }
            Err(err) => {
                let error = canvas_error(&err, "Unable to load sections.");
                warn!(page_id = %page_id, error = %err, "Failed to load canvas sections");
                self.inner.store.set_state(|state| {
                    state.is_loading = false;
                    state.error = Some(error.clone());
                });
                self.emit_error(page_id, error.clone());
                Err(Error::network(error.message, err.status(), None))
            }
        }
    }

    async fn apply_sections(
        &self,
        data: SectionsResponse,
        etag: Option<String>,
        options: LoadOptions,
    ) -> Result<SnapshotDiff> {
        let SectionsResponse {
            page,
            sections,
            etag: body_etag,
            page_etag,
        } = data;
        let sections_etag = etag.or(body_etag);
        let live: HashSet<Uuid> = sections.iter().map(|s| s.id).collect();
        let snapshot = CanvasSnapshot::new(page, sections);
        let fetched_at = snapshot.retrieved_at;

        self.commit_snapshot(
            snapshot,
            SnapshotSource::Remote,
            move |state| {
                state.is_loading = false;
                state.error = None;
                state.optimistic_section_ids.clear();
                state.conflict_section_ids.retain(|id| live.contains(id));
                if sections_etag.is_some() {
                    state.sections_etag = sections_etag;
                }
                if page_etag.is_some() {
                    state.page_etag = page_etag;
                }
                state.last_fetched_at = Some(fetched_at);
                state.last_synced_at = Some(fetched_at);
            },
            options.force.then_some(true),
        )
        .await
    }

    /// Fetch the content change log of the active page.
    ///
    /// Cached history is returned unless `force` is set. Failures are recorded
    /// in the store and the cached history is returned.
    pub async fn load_history(&self, page_id: Uuid, force: bool) -> Vec<HistoryEntry> {
        let state = self.state();
        if !state.is_active(page_id) {
            return Vec::new();
        }
        if !force && !state.history.is_empty() {
            return state.history.clone();
        }

        let result = self.inner.api.fetch_history(page_id).await;
        if !self.state().is_active(page_id) {
            return Vec::new();
        }

        let now = Utc::now();
        match result {
            Ok(Fetched::Modified { data, etag }) => {
                let history_etag = etag.or(data.etag);
                let history = data.history;
                let stored = history.clone();
                self.inner.store.set_state(move |state| {
                    state.history = stored;
                    if history_etag.is_some() {
                        state.history_etag = history_etag;
                    }
                    state.last_history_fetched_at = Some(now);
                });
                history
            }
            Ok(Fetched::NotModified) => {
                self.inner.store.set_state(|state| {
                    state.last_history_fetched_at = Some(now);
                });
                self.state().history.clone()
            }
            Err(err) => {
                warn!(page_id = %page_id, error = %err, "Failed to load content history");
                let error = canvas_error(&err, "Unable to load history.");
                self.inner.store.set_state(|state| state.error = Some(error));
                self.state().history.clone()
            }
        }
    }
}
