//! Baseline Cache
//!
//! Two-tier store of the last confirmed snapshot per page. The in-memory map
//! is authoritative and consulted first; the durable tier is a write-through
//! mirror holding every page's record as one JSON map under a single key, so
//! editors sharing the same session store see each other's baselines.
//!
//! Durable failures are logged and swallowed: memory stays authoritative for
//! the lifetime of the process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::diff::SnapshotEnvelope;
use crate::kv::KeyValueStore;

/// Last confirmed state of one page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineRecord {
    /// Envelopes keyed by section id
    pub snapshots: BTreeMap<Uuid, SnapshotEnvelope>,
    /// Last modification of the record
    #[serde(rename = "updatedAtUtc")]
    pub updated_at: DateTime<Utc>,
    /// Bumped on every mutation of the record
    pub version: u64,
}

impl BaselineRecord {
    fn empty() -> Self {
        Self {
            snapshots: BTreeMap::new(),
            updated_at: Utc::now(),
            version: 0,
        }
    }
}

type DurableMap = BTreeMap<Uuid, BaselineRecord>;

/// Two-tier baseline store
#[derive(Clone)]
pub struct BaselineCache {
    memory: Arc<RwLock<HashMap<Uuid, BaselineRecord>>>,
    durable: Arc<dyn KeyValueStore>,
    storage_key: String,
    /// Serializes read-modify-write cycles on the durable map
    write_lock: Arc<Mutex<()>>,
}

impl BaselineCache {
    /// Create a cache mirrored into `durable` under `storage_key`
    pub fn new(durable: Arc<dyn KeyValueStore>, storage_key: impl Into<String>) -> Self {
        Self {
            memory: Arc::new(RwLock::new(HashMap::new())),
            durable,
            storage_key: storage_key.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Load the record of a page: memory first, then the durable tier
    pub async fn load(&self, page_id: Uuid) -> Option<BaselineRecord> {
        if let Some(record) = self.memory.read().await.get(&page_id) {
            return Some(record.clone());
        }

        let record = self.read_durable().await.remove(&page_id)?;
        debug!(page_id = %page_id, version = record.version, "Baseline restored from session store");
        self.memory.write().await.insert(page_id, record.clone());
        Some(record)
    }

    /// Replace the whole record of a page
    pub async fn save(
        &self,
        page_id: Uuid,
        envelopes: impl IntoIterator<Item = SnapshotEnvelope>,
        version: u64,
    ) -> BaselineRecord {
        let record = BaselineRecord {
            snapshots: envelopes
                .into_iter()
                .map(|envelope| (envelope.section_id, envelope))
                .collect(),
            updated_at: Utc::now(),
            version,
        };
        self.store(page_id, record.clone()).await;
        record
    }

    /// Insert or replace one section envelope
    pub async fn update(&self, page_id: Uuid, envelope: SnapshotEnvelope) -> BaselineRecord {
        let mut record = self
            .load(page_id)
            .await
            .unwrap_or_else(BaselineRecord::empty);
        record.snapshots.insert(envelope.section_id, envelope);
        record.version += 1;
        record.updated_at = Utc::now();
        self.store(page_id, record.clone()).await;
        record
    }

    /// Remove one section envelope; `None` when the page has no record
    pub async fn remove(&self, page_id: Uuid, section_id: Uuid) -> Option<BaselineRecord> {
        let mut record = self.load(page_id).await?;
        record.snapshots.remove(&section_id);
        record.version += 1;
        record.updated_at = Utc::now();
        self.store(page_id, record.clone()).await;
        Some(record)
    }

    /// Drop the record of one page, or of every page
    pub async fn clear(&self, page_id: Option<Uuid>) {
        let _guard = self.write_lock.lock().await;
        match page_id {
            Some(page_id) => {
                self.memory.write().await.remove(&page_id);
                let mut map = self.read_durable().await;
                if map.remove(&page_id).is_some() {
                    self.write_durable(&map).await;
                }
            }
            None => {
                self.memory.write().await.clear();
                if let Err(e) = self.durable.delete(&self.storage_key).await {
                    warn!(error = %e, "Failed to clear baseline session store");
                }
            }
        }
    }

    async fn store(&self, page_id: Uuid, record: BaselineRecord) {
        let _guard = self.write_lock.lock().await;
        self.memory.write().await.insert(page_id, record.clone());

        let mut map = self.read_durable().await;
        map.insert(page_id, record);
        self.write_durable(&map).await;
    }

    async fn read_durable(&self) -> DurableMap {
        match self.durable.get(&self.storage_key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Discarding unreadable baseline session data");
                DurableMap::new()
            }),
            Ok(None) => DurableMap::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read baseline session store");
                DurableMap::new()
            }
        }
    }

    async fn write_durable(&self, map: &DurableMap) {
        let raw = match serde_json::to_string(map) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to serialize baseline");
                return;
            }
        };
        if let Err(e) = self.durable.set(&self.storage_key, &raw).await {
            warn!(error = %e, "Failed to persist baseline");
        }
    }
}
