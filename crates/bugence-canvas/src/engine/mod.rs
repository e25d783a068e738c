//! Canvas Engine
//!
//! Keeps the locally edited sections of one page consistent with the content
//! service. Every transition goes through [`CanvasEngine::commit_snapshot`],
//! which diffs against the previous snapshot, resolves the baseline, recomputes
//! dirty sections and announces the result locally and on the sync channel.
//!
//! - `commit`: shared commit path
//! - `load`: foreground sections and history loads
//! - `mutations`: create, update, delete and duplicate
//! - `publish`: publish and review status broadcast
//! - `worker`: background reconciliation

mod commit;
mod load;
mod mutations;
mod publish;
mod worker;

#[cfg(test)]
mod tests;

pub use load::LoadOptions;
pub use mutations::duplicate_content;
pub use worker::ReconcileOutcome;

use dashmap::DashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, watch};
use tracing::debug;
use uuid::Uuid;

use crate::api::{ApiError, ContentApi};
use crate::baseline::BaselineCache;
use crate::bus::{Subscription, SyncBus, SyncEnvelope, SyncEvent};
use crate::config::SyncConfig;
use crate::error::{CanvasError, Error};
use crate::events::{CanvasEvent, CanvasEventType};
use crate::store::{CanvasState, CanvasStore};

use worker::SyncWorker;

/// Sync engine for one editing context
#[derive(Clone)]
pub struct CanvasEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    api: Arc<dyn ContentApi>,
    store: CanvasStore,
    baseline: BaselineCache,
    bus: SyncBus,
    events: broadcast::Sender<CanvasEvent>,
    config: SyncConfig,
    worker: Mutex<Option<SyncWorker>>,
    /// One async lock per section, held across a whole mutation
    section_locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    /// Serializes snapshot commits and baseline writes
    commit_lock: tokio::sync::Mutex<()>,
    bus_subscription: Mutex<Option<Subscription>>,
}

impl CanvasEngine {
    /// Create an engine and start listening on the sync channel.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        api: Arc<dyn ContentApi>,
        bus: SyncBus,
        baseline: BaselineCache,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Arc::new(EngineInner {
            api,
            store: CanvasStore::new(),
            baseline,
            bus,
            events,
            config,
            worker: Mutex::new(None),
            section_locks: DashMap::new(),
            commit_lock: tokio::sync::Mutex::new(()),
            bus_subscription: Mutex::new(None),
        });

        let weak: Weak<EngineInner> = Arc::downgrade(&inner);
        let subscription = inner
            .bus
            .subscribe_with(Arc::new(move |envelope: &SyncEnvelope| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_remote_event(envelope);
                }
            }));
        if let Ok(mut slot) = inner.bus_subscription.lock() {
            *slot = Some(subscription);
        }

        debug!(bus_id = %inner.bus.id(), "Canvas engine created");
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<EngineInner>) -> Self {
        Self { inner }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> Arc<CanvasState> {
        self.inner.store.get_state()
    }

    /// Receiver notified after every state transition
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<Arc<CanvasState>> {
        self.inner.store.subscribe()
    }

    /// Local store transition events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CanvasEvent> {
        self.inner.events.subscribe()
    }

    /// The sync channel this engine publishes on
    #[must_use]
    pub fn bus(&self) -> &SyncBus {
        &self.inner.bus
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Page the background worker is reconciling, if any
    #[must_use]
    pub fn worker_page(&self) -> Option<Uuid> {
        self.inner
            .worker
            .lock()
            .ok()
            .and_then(|worker| worker.as_ref().map(SyncWorker::page_id))
    }

    /// Clear the active page's baseline (or every baseline when no page is
    /// active), stop the background worker and restore the initial state
    pub async fn reset(&self) {
        let page_id = self.state().page_id;
        self.inner.baseline.clear(page_id).await;
        self.stop_sync_worker();
        self.inner.store.reset();
        self.inner.section_locks.clear();
        debug!(page_id = ?page_id, "Canvas engine reset");
    }

    fn emit(&self, event: CanvasEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    fn emit_error(&self, page_id: Uuid, error: CanvasError) {
        self.emit(CanvasEvent::new(CanvasEventType::Error, page_id).with_error(error));
    }

    fn section_lock(&self, section_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .section_locks
            .entry(section_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Fail with `Superseded` when `page_id` is no longer the active page
    fn ensure_active(&self, page_id: Uuid) -> Result<(), Error> {
        if self.state().is_active(page_id) {
            Ok(())
        } else {
            Err(Error::Superseded(page_id))
        }
    }
}

impl EngineInner {
    /// Fold another editor's event into the store
    fn apply_remote_event(&self, envelope: &SyncEnvelope) {
        if envelope.source == self.bus.id() {
            return;
        }
        if !self.store.get_state().is_active(envelope.event.page_id()) {
            return;
        }

        match &envelope.event {
            SyncEvent::ReviewStatusUpdated(payload) => {
                debug!(section_id = %payload.section_id, status = ?payload.status, "Review status received");
                self.store.set_state(|state| {
                    state.review_statuses.insert(payload.section_id, payload.status);
                });
            }
            SyncEvent::SectionConflicted(payload) => {
                debug!(section_id = %payload.section_id, "Conflict reported by another editor");
                self.store.set_state(|state| {
                    state.conflict_section_ids.insert(payload.section_id);
                    state.dirty_section_ids.insert(payload.section_id);
                });
            }
            _ => {}
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(worker) = worker.take() {
                worker.stop();
            }
        }
    }
}

/// Store-facing form of a transport failure
fn canvas_error(err: &ApiError, fallback: &str) -> CanvasError {
    let message = err.message();
    let message = if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message
    };
    CanvasError::new(message).with_status(err.status())
}

/// Decrements the in-flight mutation counter when dropped
struct MutationGuard<'a> {
    store: &'a CanvasStore,
}

impl<'a> MutationGuard<'a> {
    fn new(store: &'a CanvasStore) -> Self {
        store.set_state(|state| state.pending_mutations += 1);
        Self { store }
    }
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        self.store.set_state(|state| {
            state.pending_mutations = state.pending_mutations.saturating_sub(1);
        });
    }
}
