use chrono::Utc;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::commit::{live_snapshot, tracked_envelope};
use super::{canvas_error, CanvasEngine, LoadOptions, MutationGuard};
use crate::api::ApiError;
use crate::bus::{
    SectionChangedPayload, SectionCommittedPayload, SectionConflictPayload, SnapshotSource,
    SyncEvent,
};
use crate::diff::{section_diff, DiffEnvelope, DiffOptions, SnapshotEnvelope};
use crate::error::{CanvasError, Error, Result};
use crate::events::{CanvasEvent, CanvasEventType};
use crate::model::{ContentType, Section, SectionCreate, SectionUpdate, SectionUpsert};

const CONFLICT_MESSAGE: &str = "Section has been updated by another editor.";

static HTML_TAG: OnceLock<Option<Regex>> = OnceLock::new();

fn contains_html(value: &str) -> bool {
    HTML_TAG
        .get_or_init(|| Regex::new(r"<\w").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(value))
}

/// Content for a duplicated section.
///
/// Plain text gets a visible ` (Copy)` or ` (Variant X)` suffix, HTML an inert
/// marker comment. Applying it twice yields the same value.
#[must_use]
pub fn duplicate_content(value: &str, variant_label: Option<&str>) -> String {
    let suffix = match variant_label {
        Some(label) => format!(" (Variant {label})"),
        None => " (Copy)".to_string(),
    };

    if contains_html(value) {
        if value.contains("<!-- duplicate") {
            return value.to_string();
        }
        return format!("{value}\n<!-- duplicate {} -->", suffix.trim());
    }

    let base = value.trim_end_matches(' ');
    if base.ends_with(&suffix) {
        base.to_string()
    } else {
        format!("{base}{suffix}")
    }
}

impl CanvasEngine {
    /// Create a section on the active page.
    ///
    /// Not applied optimistically. The new section becomes part of the live
    /// snapshot but not of the baseline, so it stays dirty until published.
    pub async fn create_section(&self, page_id: Uuid, create: SectionCreate) -> Result<Section> {
        let selector = create.selector.trim().to_string();
        if selector.is_empty() {
            return Err(Error::validation("Selector is required to create a section."));
        }
        let state = self.state();
        if !state.is_active(page_id) || state.page.is_none() {
            return Err(Error::PageNotLoaded(page_id));
        }

        let _pending = MutationGuard::new(&self.inner.store);
        self.inner.store.set_state(|state| state.error = None);

        let payload = SectionUpsert::from(SectionCreate { selector, ..create });
        let result = self.inner.api.upsert_section(page_id, payload, None).await;
        self.ensure_active(page_id)?;

        let mutation = match result {
            Ok(mutation) => mutation,
            Err(err) => {
                return Err(self.record_failure(page_id, None, &err, "Unable to create section."))
            }
        };
        let Some(section) = mutation.section else {
            let error = CanvasError::new("Server did not return the created section.");
            self.inner.store.set_state(|state| state.error = Some(error.clone()));
            return Err(Error::network(error.message, None, None));
        };

        let etag = mutation.section_etag.or_else(|| section.etag.clone());
        let created = section.with_etag(etag);
        let snapshot = live_snapshot(&self.state())
            .ok_or(Error::PageNotLoaded(page_id))?
            .upsert_section(created.clone());
        let page_etag = mutation.page_etag;
        self.commit_snapshot(
            snapshot,
            SnapshotSource::Local,
            move |state| {
                state.error = None;
                if page_etag.is_some() {
                    state.page_etag = page_etag;
                }
            },
            None,
        )
        .await?;

        let diff = section_diff(
            None,
            Some(&SnapshotEnvelope::capture(page_id, &created)),
            DiffOptions::detecting_conflicts(),
        );
        self.inner
            .bus
            .publish(SyncEvent::SectionChanged(SectionChangedPayload {
                page_id,
                section_id: created.id,
                diff,
                dirty: true,
            }));

        info!(page_id = %page_id, section_id = %created.id, "Section created");
        Ok(created)
    }

    /// Edit a section optimistically.
    ///
    /// The edit is shown before the round trip and sent with the section's
    /// last known token. On a stale token the section is rolled back, marked
    /// conflicted and a forced reload is scheduled; on any other failure it is
    /// rolled back. Mutations of the same section run one at a time.
    pub async fn update_section(&self, page_id: Uuid, update: SectionUpdate) -> Result<Section> {
        let section_id = update.section_id;
        let lock = self.section_lock(section_id);
        let _serial = lock.lock().await;

        let state = self.state();
        if !state.is_active(page_id) {
            return Err(Error::PageNotLoaded(page_id));
        }
        let original = state
            .section(section_id)
            .cloned()
            .ok_or(Error::SectionNotFound(section_id))?;
        let snapshot = live_snapshot(&state).ok_or(Error::PageNotLoaded(page_id))?;

        let _pending = MutationGuard::new(&self.inner.store);
        let optimistic = original.with_edit(&update);
        self.commit_snapshot(
            snapshot.upsert_section(optimistic.clone()),
            SnapshotSource::Local,
            move |state| {
                state.optimistic_section_ids.insert(section_id);
                state.conflict_section_ids.remove(&section_id);
                state.error = None;
            },
            None,
        )
        .await?;
        self.emit(
            CanvasEvent::new(CanvasEventType::SectionOptimistic, page_id)
                .with_section(optimistic.clone()),
        );
        debug!(page_id = %page_id, section_id = %section_id, "Optimistic edit applied");

        let result = self
            .inner
            .api
            .upsert_section(page_id, update.into(), original.etag.clone())
            .await;
        self.ensure_active(page_id)?;

        let mutation = match result {
            Ok(mutation) => mutation,
            Err(ApiError::PreconditionFailed { .. }) => {
                return Err(self.handle_conflict(page_id, &original).await);
            }
            Err(err) => return Err(self.revert(page_id, &original, &err).await),
        };

        let updated = mutation.section.unwrap_or(optimistic);
        let etag = mutation
            .section_etag
            .or_else(|| updated.etag.clone())
            .or_else(|| {
                self.state()
                    .section(section_id)
                    .and_then(|section| section.etag.clone())
            });
        let updated = updated.with_etag(etag);

        let snapshot = live_snapshot(&self.state())
            .ok_or(Error::Superseded(page_id))?
            .upsert_section(updated.clone());
        let page_etag = mutation.page_etag;
        let based_on = original.etag.clone();
        let head = updated.etag.clone();
        self.commit_snapshot(
            snapshot,
            SnapshotSource::Local,
            move |state| {
                state.record_local_revision(section_id, based_on.as_deref(), head.as_deref());
                state.optimistic_section_ids.remove(&section_id);
                state.error = None;
                if page_etag.is_some() {
                    state.page_etag = page_etag;
                }
            },
            None,
        )
        .await?;
        self.emit(
            CanvasEvent::new(CanvasEventType::SectionCommitted, page_id)
                .with_section(updated.clone()),
        );

        let diff = self.diff_against_baseline(page_id, Some(&updated));
        self.inner
            .bus
            .publish(SyncEvent::SectionCommitted(SectionCommittedPayload {
                page_id,
                section_id,
                diff,
                committed_at: Utc::now(),
            }));

        info!(page_id = %page_id, section_id = %section_id, etag = ?updated.etag, "Section saved");
        Ok(updated)
    }

    /// Delete a section after server confirmation.
    ///
    /// The section stays visible until the server accepts the delete; on
    /// failure it stays in place and the error is recorded.
    pub async fn delete_section(&self, page_id: Uuid, section_id: Uuid) -> Result<()> {
        let lock = self.section_lock(section_id);
        let _serial = lock.lock().await;

        let state = self.state();
        if !state.is_active(page_id) {
            return Err(Error::PageNotLoaded(page_id));
        }
        let target = state
            .section(section_id)
            .cloned()
            .ok_or(Error::SectionNotFound(section_id))?;

        let _pending = MutationGuard::new(&self.inner.store);
        let result = self
            .inner
            .api
            .delete_section(page_id, section_id, target.etag.clone())
            .await;
        self.ensure_active(page_id)?;

        let reply = match result {
            Ok(reply) => reply,
            Err(ApiError::PreconditionFailed { .. }) => {
                return Err(self.handle_conflict(page_id, &target).await);
            }
            Err(err) => {
                return Err(self.record_failure(
                    page_id,
                    Some(section_id),
                    &err,
                    "Unable to delete section.",
                ))
            }
        };

        let removal = section_diff(
            self.state().baseline.get(&section_id),
            None,
            DiffOptions::default(),
        );

        let snapshot = live_snapshot(&self.state())
            .ok_or(Error::Superseded(page_id))?
            .remove_section(section_id);
        let page_etag = reply.page_etag;
        self.commit_snapshot(
            snapshot,
            SnapshotSource::Local,
            move |state| {
                state
                    .history
                    .retain(|entry| entry.page_section_id != Some(section_id));
                state.review_statuses.remove(&section_id);
                state.local_revisions.remove(&section_id);
                state.optimistic_section_ids.remove(&section_id);
                state.conflict_section_ids.remove(&section_id);
                state.error = None;
                if page_etag.is_some() {
                    state.page_etag = page_etag;
                }
            },
            None,
        )
        .await?;

        self.inner
            .bus
            .publish(SyncEvent::SectionCommitted(SectionCommittedPayload {
                page_id,
                section_id,
                diff: removal,
                committed_at: Utc::now(),
            }));
        self.inner.section_locks.remove(&section_id);

        info!(page_id = %page_id, section_id = %section_id, "Section deleted");
        Ok(())
    }

    /// Create a copy of a section under the same selector
    pub async fn duplicate_section(
        &self,
        page_id: Uuid,
        section_id: Uuid,
        variant_label: Option<&str>,
    ) -> Result<Section> {
        let state = self.state();
        let original = state
            .section(section_id)
            .ok_or(Error::SectionNotFound(section_id))?;
        let selector = original
            .css_selector
            .clone()
            .filter(|selector| !selector.trim().is_empty())
            .ok_or_else(|| Error::validation("Section cannot be duplicated without a selector."))?;
        if original.content_type == ContentType::Image {
            return Err(Error::validation(
                "Image sections cannot be duplicated automatically.",
            ));
        }

        let create = SectionCreate {
            selector,
            content_type: Some(original.content_type),
            content_value: original
                .content_value
                .as_deref()
                .map(|value| duplicate_content(value, variant_label)),
            media_alt_text: original.media_alt_text.clone(),
            image: None,
        };
        self.create_section(page_id, create).await
    }

    /// Roll back to `original`, mark it conflicted and schedule a forced reload
    async fn handle_conflict(&self, page_id: Uuid, original: &Section) -> Error {
        let section_id = original.id;
        let error = CanvasError::new(CONFLICT_MESSAGE)
            .with_status(Some(412))
            .with_section(section_id);
        warn!(page_id = %page_id, section_id = %section_id, "Section conflict, reloading");

        if let Some(snapshot) = live_snapshot(&self.state()) {
            let stored = error.clone();
            let reverted = self
                .commit_snapshot(
                    snapshot.upsert_section(original.clone()),
                    SnapshotSource::Local,
                    move |state| {
                        state.optimistic_section_ids.remove(&section_id);
                        state.conflict_section_ids.insert(section_id);
                        state.error = Some(stored);
                    },
                    None,
                )
                .await;
            if let Err(e) = reverted {
                debug!(page_id = %page_id, error = %e, "Conflict rollback skipped");
            }
        }
        self.emit(
            CanvasEvent::new(CanvasEventType::SectionConflict, page_id)
                .with_section(original.clone())
                .with_error(error.clone()),
        );

        let diff = self.diff_against_baseline(page_id, Some(original));
        self.inner
            .bus
            .publish(SyncEvent::SectionConflicted(SectionConflictPayload {
                page_id,
                section_id,
                diff,
                detected_at: Utc::now(),
            }));

        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.load_sections(page_id, LoadOptions::forced()).await {
                warn!(page_id = %page_id, error = %e, "Reload after conflict failed");
            }
        });

        Error::conflict(error.message, Some(section_id))
    }

    /// Roll back to `original` after a non-conflict failure
    async fn revert(&self, page_id: Uuid, original: &Section, err: &ApiError) -> Error {
        let section_id = original.id;
        let error = canvas_error(err, "Unable to save section.").with_section(section_id);
        warn!(page_id = %page_id, section_id = %section_id, error = %err, "Section save failed, reverting");

        if let Some(snapshot) = live_snapshot(&self.state()) {
            let stored = error.clone();
            let reverted = self
                .commit_snapshot(
                    snapshot.upsert_section(original.clone()),
                    SnapshotSource::Local,
                    move |state| {
                        state.optimistic_section_ids.remove(&section_id);
                        state.error = Some(stored);
                    },
                    None,
                )
                .await;
            if let Err(e) = reverted {
                debug!(page_id = %page_id, error = %e, "Rollback skipped");
            }
        }
        self.emit(
            CanvasEvent::new(CanvasEventType::SectionReverted, page_id)
                .with_section(original.clone())
                .with_error(error.clone()),
        );
        self.emit_error(page_id, error.clone());

        Error::network(error.message, error.status, Some(section_id))
    }

    /// Record a failure that left the store untouched
    fn record_failure(
        &self,
        page_id: Uuid,
        section_id: Option<Uuid>,
        err: &ApiError,
        fallback: &str,
    ) -> Error {
        let mut error = canvas_error(err, fallback);
        error.section_id = section_id;
        warn!(page_id = %page_id, section_id = ?section_id, error = %err, "Section mutation failed");

        self.inner.store.set_state(|state| state.error = Some(error.clone()));
        self.emit_error(page_id, error.clone());

        Error::network(error.message, error.status, section_id)
    }

    /// Diff of a section value against its baseline entry
    fn diff_against_baseline(
        &self,
        page_id: Uuid,
        section: Option<&Section>,
    ) -> Option<DiffEnvelope> {
        let section = section?;
        let state = self.state();
        section_diff(
            state.baseline.get(&section.id),
            Some(&tracked_envelope(page_id, section, &state)),
            DiffOptions::detecting_conflicts(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_plain_text() {
        assert_eq!(duplicate_content("Welcome", None), "Welcome (Copy)");
        assert_eq!(duplicate_content("Welcome ", Some("B")), "Welcome (Variant B)");
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let once = duplicate_content("Welcome", None);
        assert_eq!(duplicate_content(&once, None), once);

        let html = duplicate_content("<p>Hi</p>", Some("B"));
        assert_eq!(html, "<p>Hi</p>\n<!-- duplicate (Variant B) -->");
        assert_eq!(duplicate_content(&html, Some("B")), html);
    }

    #[test]
    fn test_html_detection() {
        assert!(contains_html("<div>x</div>"));
        assert!(!contains_html("a < b"));
    }
}
