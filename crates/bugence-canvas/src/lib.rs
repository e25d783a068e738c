//! Bugence Canvas - Content Synchronization Engine
//!
//! This crate keeps a page's editable sections consistent between an editor
//! and the Bugence content service:
//! - Model: Page, section and history types exchanged with the service
//! - Diff: Section fingerprints, snapshot diffs and publish summaries
//! - Baseline: Last confirmed section state, cached in memory and on disk
//! - Store: Observable state container for the active page
//! - Bus: Named cross-engine sync channel
//! - Engine: Loads, optimistic mutations, publish and background reconciliation
//! - Api: Content service seam and its HTTP implementation
//! - Error: Error types for canvas operations
//! - Events: Local store transition events
//!
//! ## Features
//!
//! - Optimistic section edits with rollback on failure
//! - Optimistic concurrency through section and page tokens
//! - Dirty tracking against the last published baseline
//! - Convergence of several editors through the sync channel
//! - Periodic conditional refetch of the active page
//! - Session persistence with SQLite
//!
//! ## Usage
//!
//! ```ignore
//! use bugence_canvas::{
//!     BaselineCache, CanvasEngine, HttpContentApi, LoadOptions, MemoryKvStore, SectionUpdate,
//!     SyncBus, SyncConfig,
//! };
//! use std::sync::Arc;
//!
//! let config = SyncConfig::default().with_base_url("https://cms.example.com");
//! let api = Arc::new(HttpContentApi::new(&config)?);
//! let bus = SyncBus::open(&config.channel_name, config.event_capacity);
//! let baseline = BaselineCache::new(Arc::new(MemoryKvStore::new()), &config.baseline_storage_key);
//! let engine = CanvasEngine::new(api, bus, baseline, config);
//!
//! engine.load(page_id, LoadOptions::default()).await?;
//! engine
//!     .update_section(page_id, SectionUpdate::content(section_id, "Hello world"))
//!     .await?;
//! engine.publish(page_id).await?;
//! ```
//!
//! ## Configuration
//!
//! ```toml
//! [canvas]
//! base_url = "http://localhost:5000"
//! content_base = "/api/content"
//! sync_interval_secs = 15
//! channel_name = "bugence:sync"
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod baseline;
pub mod bus;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod events;
pub mod kv;
pub mod model;
pub mod store;

// Re-export main types
pub use api::{ApiError, ContentApi, Fetched, HttpContentApi};
pub use baseline::{BaselineCache, BaselineRecord};
pub use bus::{SyncBus, SyncEnvelope, SyncEvent, SyncTopic};
pub use config::SyncConfig;
pub use diff::{
    ChangeType, DiffEnvelope, PublishSummary, PublishSummaryEntry, SnapshotDiff, SnapshotEnvelope,
};
pub use engine::{duplicate_content, CanvasEngine, LoadOptions, ReconcileOutcome};
pub use error::{CanvasError, Error, Result};
pub use events::{CanvasEvent, CanvasEventType};
pub use kv::{KeyValueStore, MemoryKvStore, SqliteKvStore};
pub use model::{
    CanvasSnapshot, ContentType, HistoryEntry, Page, ReviewStatus, Section, SectionCreate,
    SectionUpdate,
};
pub use store::{CanvasState, CanvasStore, LocalRevision};
