//! SyncBus - named broadcast channel shared by every editor of the same origin.
//!
//! Engines publish snapshot, section, review, publish and telemetry events
//! here; other engines on the same channel consume them to converge on one
//! page without polling.

/// Channel registry, publisher and handler dispatch.
pub mod channel;
/// Event payloads and envelope.
pub mod types;

pub use channel::{next_matching, Subscription, SyncBus, SyncHandler};
pub use types::{
    PublishSummaryPayload, ReviewStatusPayload, SectionChangedPayload, SectionCommittedPayload,
    SectionConflictPayload, SnapshotAppliedPayload, SnapshotSource, SyncEnvelope, SyncEvent,
    SyncTelemetryPayload, SyncTopic, TelemetryResult,
};
