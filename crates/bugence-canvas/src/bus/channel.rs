use super::types::{SyncEnvelope, SyncEvent};
use chrono::Utc;
use dashmap::DashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Handler invoked for every envelope delivered to a bus
pub type SyncHandler = Arc<dyn Fn(&SyncEnvelope) + Send + Sync>;

/// Named channels shared by every bus in the process
static CHANNELS: OnceLock<DashMap<String, broadcast::Sender<SyncEnvelope>>> = OnceLock::new();

fn channel(name: &str, capacity: usize) -> broadcast::Sender<SyncEnvelope> {
    CHANNELS
        .get_or_init(DashMap::new)
        .entry(name.to_string())
        .or_insert_with(|| broadcast::channel(capacity.max(1)).0)
        .clone()
}

/// Topic-scoped publish/subscribe channel shared across editors.
///
/// Buses opened with the same name see each other's events, and a bus also
/// receives what it publishes itself. Handlers registered with
/// [`SyncBus::subscribe_with`] run on a pump task in subscription order; a
/// panicking handler is logged and skipped. Slow consumers miss events
/// (lagged) rather than blocking the publisher.
#[derive(Clone)]
pub struct SyncBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    id: String,
    name: String,
    sender: broadcast::Sender<SyncEnvelope>,
    listeners: RwLock<Vec<(u64, SyncHandler)>>,
    next_listener: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SyncBus {
    /// Open (or join) the channel with the given name.
    ///
    /// Capacity only applies when this call creates the channel.
    #[must_use]
    pub fn open(name: &str, capacity: usize) -> Self {
        let inner = BusInner {
            id: format!("bus_{}", Uuid::new_v4().simple()),
            name: name.to_string(),
            sender: channel(name, capacity),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            pump: Mutex::new(None),
        };
        debug!(channel = %name, bus_id = %inner.id, "Sync bus opened");
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Identifier stamped as `source` on published envelopes
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Channel name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Publish an event to every bus on the channel.
    ///
    /// Returns the envelope that was sent. If nobody is listening, the event
    /// is silently dropped.
    pub fn publish(&self, event: SyncEvent) -> SyncEnvelope {
        let envelope = SyncEnvelope {
            id: Uuid::new_v4(),
            event,
            timestamp: Utc::now(),
            source: self.inner.id.clone(),
        };
        // send() returns Err if there are no receivers, which is fine
        let _ = self.inner.sender.send(envelope.clone());
        envelope
    }

    /// Raw stream of every envelope published on the channel from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEnvelope> {
        self.inner.sender.subscribe()
    }

    /// Register a handler; it stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe_with(&self, handler: SyncHandler) -> Subscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.inner.listeners.write() {
            listeners.push((id, handler));
        }
        self.ensure_pump();

        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Number of handlers currently registered on this bus
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.inner.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    fn ensure_pump(&self) {
        let Ok(mut pump) = self.inner.pump.lock() else {
            return;
        };
        if pump.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let receiver = self.inner.sender.subscribe();
        let inner = Arc::downgrade(&self.inner);
        *pump = Some(tokio::spawn(run_pump(inner, receiver)));
    }
}

impl std::fmt::Debug for SyncBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBus")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

async fn run_pump(inner: Weak<BusInner>, mut receiver: broadcast::Receiver<SyncEnvelope>) {
    loop {
        match receiver.recv().await {
            Ok(envelope) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.dispatch(&envelope);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Sync bus handler pump lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

impl BusInner {
    fn dispatch(&self, envelope: &SyncEnvelope) {
        // Snapshot the handler list so handlers may (un)subscribe while running
        let handlers: Vec<SyncHandler> = match self.listeners.read() {
            Ok(listeners) => listeners.iter().map(|(_, h)| Arc::clone(h)).collect(),
            Err(_) => return,
        };

        for handler in handlers {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(envelope)));
            if outcome.is_err() {
                error!(
                    bus_id = %self.id,
                    topic = %envelope.event.topic(),
                    envelope_id = %envelope.id,
                    "Sync bus handler panicked"
                );
            }
        }
    }

    fn remove_listener(&self, id: u64) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }
}

/// Handle to a registered handler; unsubscribes on drop
#[must_use = "dropping a Subscription unsubscribes the handler"]
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Subscription {
    /// Remove the handler now
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_listener(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Wait for the next envelope matching `predicate` on a raw receiver
pub async fn next_matching<F>(
    receiver: &mut broadcast::Receiver<SyncEnvelope>,
    mut predicate: F,
) -> Option<SyncEnvelope>
where
    F: FnMut(&SyncEnvelope) -> bool,
{
    loop {
        match receiver.recv().await {
            Ok(envelope) if predicate(&envelope) => return Some(envelope),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
