use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::commit::tracked_envelopes;
use super::{canvas_error, CanvasEngine, LoadOptions};
use crate::api::ApiError;
use crate::bus::{PublishSummaryPayload, ReviewStatusPayload, SyncEvent};
use crate::diff::{capture_all, diff_envelope_sets, DiffOptions, PublishSummary};
use crate::error::{CanvasError, Error, Result};

const PUBLISH_CONFLICT_MESSAGE: &str = "Page has been updated elsewhere. Reload before publishing.";

impl CanvasEngine {
    /// Publish the active page.
    ///
    /// On success the live sections become the new baseline: dirty ids are
    /// cleared (except optimistic and conflicted ones), review statuses are
    /// dropped and the released changes are broadcast as a publish summary.
    pub async fn publish(&self, page_id: Uuid) -> Result<PublishSummary> {
        if !self.state().is_active(page_id) {
            return Err(Error::PageNotLoaded(page_id));
        }

        let mut claimed = false;
        self.inner.store.set_state(|state| {
            if !state.is_publishing {
                state.is_publishing = true;
                state.error = None;
                claimed = true;
            }
        });
        if !claimed {
            return Err(Error::PublishInProgress(page_id));
        }

        let if_match = self.state().page_etag.clone();
        let result = self.inner.api.publish_page(page_id, if_match).await;
        if !self.state().is_active(page_id) {
            self.inner.store.set_state(|state| state.is_publishing = false);
            return Err(Error::Superseded(page_id));
        }

        let reply = match result {
            Ok(reply) => reply,
            Err(ApiError::PreconditionFailed { .. }) => {
                warn!(page_id = %page_id, "Publish rejected on stale page token, reloading");
                let error = CanvasError::new(PUBLISH_CONFLICT_MESSAGE).with_status(Some(412));
                self.inner.store.set_state(|state| {
                    state.is_publishing = false;
                    state.error = Some(error.clone());
                });
                self.emit_error(page_id, error);
                if let Err(e) = self.load_sections(page_id, LoadOptions::forced()).await {
                    warn!(page_id = %page_id, error = %e, "Reload after publish conflict failed");
                }
                return Err(Error::conflict(PUBLISH_CONFLICT_MESSAGE, None));
            }
            Err(err) => {
                warn!(page_id = %page_id, error = %err, "Publish failed");
                let error = canvas_error(&err, "Unable to publish page.");
                self.inner.store.set_state(|state| {
                    state.is_publishing = false;
                    state.error = Some(error.clone());
                });
                self.emit_error(page_id, error.clone());
                return Err(Error::network(error.message, error.status, None));
            }
        };

        let summary = {
            let _commit = self.inner.commit_lock.lock().await;
            let current = self.state();
            let envelopes = capture_all(page_id, &current.sections);
            let diffs = diff_envelope_sets(
                current.baseline.values(),
                &tracked_envelopes(page_id, &current),
                DiffOptions::detecting_conflicts(),
            );
            let summary = PublishSummary::build(page_id, &diffs, &current.review_statuses);

            let record = self
                .inner
                .baseline
                .save(page_id, envelopes, current.baseline_version + 1)
                .await;
            let now = Utc::now();
            self.inner.store.set_state(move |state| {
                state.is_publishing = false;
                state.error = None;
                if reply.etag.is_some() {
                    state.page_etag = reply.etag;
                }
                state.baseline = record.snapshots;
                state.baseline_version = record.version;
                state.dirty_section_ids = state
                    .optimistic_section_ids
                    .union(&state.conflict_section_ids)
                    .copied()
                    .collect();
                state.review_statuses.clear();
                state.local_revisions.clear();
                state.last_synced_at = Some(now);
            });
            summary
        };

        if !summary.is_empty() {
            self.inner
                .bus
                .publish(SyncEvent::PublishSummary(PublishSummaryPayload {
                    page_id,
                    summary: summary.clone(),
                    prepared_at: summary.generated_at,
                }));
        }

        info!(page_id = %page_id, changes = summary.entries.len(), "Page published");
        Ok(summary)
    }

    /// Record a reviewer verdict locally and share it with other editors
    pub fn publish_review_status(&self, payload: ReviewStatusPayload) -> Result<()> {
        let state = self.state();
        if !state.is_active(payload.page_id) {
            return Err(Error::PageNotLoaded(payload.page_id));
        }
        if state.section(payload.section_id).is_none() {
            return Err(Error::SectionNotFound(payload.section_id));
        }

        let (section_id, status) = (payload.section_id, payload.status);
        self.inner.store.set_state(|state| {
            state.review_statuses.insert(section_id, status);
        });
        self.inner.bus.publish(SyncEvent::ReviewStatusUpdated(payload));
        Ok(())
    }
}
