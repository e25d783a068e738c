use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{CanvasEngine, EngineInner};
use crate::api::Fetched;
use crate::bus::{SnapshotSource, SyncEvent, SyncTelemetryPayload, TelemetryResult};
use crate::diff::SnapshotDiff;
use crate::error::Error;
use crate::model::{CanvasSnapshot, SectionsResponse};
use crate::store::CanvasState;

/// Result of one reconciliation tick
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Page inactive or a save, publish or load was in flight
    Skipped,
    /// Server reported no change
    NotModified,
    /// A newer snapshot was committed
    Applied(SnapshotDiff),
    /// Fetch or commit failed
    Failed(String),
}

/// Periodic reconciliation task bound to one page
pub(super) struct SyncWorker {
    page_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    fn spawn(inner: Weak<EngineInner>, page_id: Uuid, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            debug!(page_id = %page_id, interval_secs = interval.as_secs(), "Sync worker started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = token.cancelled() => break,
                }

                let Some(inner) = inner.upgrade() else { break };
                let engine = CanvasEngine::from_inner(inner);
                tokio::select! {
                    outcome = engine.reconcile(page_id) => {
                        debug!(page_id = %page_id, outcome = ?outcome, "Sync tick finished");
                    }
                    _ = token.cancelled() => break,
                }
            }
            debug!(page_id = %page_id, "Sync worker stopped");
        });

        Self {
            page_id,
            cancel,
            handle,
        }
    }

    pub(super) fn page_id(&self) -> Uuid {
        self.page_id
    }

    pub(super) fn stop(self) {
        self.cancel.cancel();
        drop(self.handle);
    }
}

fn can_reconcile(state: &CanvasState, page_id: Uuid) -> bool {
    state.is_active(page_id) && !state.is_saving() && !state.is_publishing && !state.is_loading
}

impl CanvasEngine {
    /// Start reconciling `page_id`, replacing the worker of any other page
    pub(super) fn ensure_sync_worker(&self, page_id: Uuid) {
        let Ok(mut slot) = self.inner.worker.lock() else {
            return;
        };
        if slot
            .as_ref()
            .is_some_and(|worker| worker.page_id() == page_id && !worker.handle.is_finished())
        {
            return;
        }
        if let Some(previous) = slot.take() {
            previous.stop();
        }
        *slot = Some(SyncWorker::spawn(
            Arc::downgrade(&self.inner),
            page_id,
            self.inner.config.sync_interval(),
        ));
    }

    /// Stop the background worker, if one is running
    pub fn stop_sync_worker(&self) {
        let worker = self.inner.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(worker) = worker {
            debug!(page_id = %worker.page_id(), "Stopping sync worker");
            worker.stop();
        }
    }

    /// Run one reconciliation tick for `page_id`.
    ///
    /// Issues a conditional fetch with the last sections token. A newer
    /// snapshot goes through the regular commit path tagged as remote. Never
    /// fails: errors are logged and reported as `sync.telemetry`.
    pub async fn reconcile(&self, page_id: Uuid) -> ReconcileOutcome {
        let state = self.state();
        if !can_reconcile(&state, page_id) {
            return ReconcileOutcome::Skipped;
        }

        let started = Instant::now();
        let result = self
            .inner
            .api
            .fetch_sections(page_id, state.sections_etag.clone())
            .await;

        let outcome = match result {
            Ok(Fetched::NotModified) => {
                let now = Utc::now();
                self.inner.store.set_state(|state| {
                    if state.is_active(page_id) {
                        state.last_synced_at = Some(now);
                    }
                });
                ReconcileOutcome::NotModified
            }
            Ok(Fetched::Modified { data, etag }) => {
                if can_reconcile(&self.state(), page_id) {
                    self.apply_remote(page_id, data, etag).await
                } else {
                    ReconcileOutcome::Skipped
                }
            }
            Err(err) => {
                warn!(page_id = %page_id, error = %err, "Background sync failed");
                ReconcileOutcome::Failed(err.message())
            }
        };

        self.report(page_id, started, &outcome);
        outcome
    }

    async fn apply_remote(
        &self,
        page_id: Uuid,
        data: SectionsResponse,
        etag: Option<String>,
    ) -> ReconcileOutcome {
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

        let committed = self
            .commit_snapshot(
                snapshot,
                SnapshotSource::Remote,
                move |state| {
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
                None,
            )
            .await;

        match committed {
            Ok(diff) => ReconcileOutcome::Applied(diff),
            Err(Error::Superseded(_)) => ReconcileOutcome::Skipped,
            Err(e) => {
                warn!(page_id = %page_id, error = %e, "Background snapshot rejected");
                ReconcileOutcome::Failed(e.to_string())
            }
        }
    }

    fn report(&self, page_id: Uuid, started: Instant, outcome: &ReconcileOutcome) {
        let (result, error_message) = match outcome {
            ReconcileOutcome::Skipped => return,
            ReconcileOutcome::NotModified => (TelemetryResult::Noop, None),
            ReconcileOutcome::Applied(_) => (TelemetryResult::Success, None),
            ReconcileOutcome::Failed(message) => (TelemetryResult::Error, Some(message.clone())),
        };
        self.inner
            .bus
            .publish(SyncEvent::Telemetry(SyncTelemetryPayload {
                page_id,
                duration_ms: started.elapsed().as_millis() as u64,
                result,
                error_message,
            }));
    }
}
