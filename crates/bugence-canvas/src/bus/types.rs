use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diff::{DiffEnvelope, PublishSummary, SnapshotEnvelope};
use crate::model::ReviewStatus;

/// Where an applied snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    /// Authoritative read from the content service
    Remote,
    /// Result of a local mutation
    Local,
}

/// Outcome of one reconciliation tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryResult {
    /// Remote changes were applied
    Success,
    /// Nothing changed remotely
    Noop,
    /// The tick failed
    Error,
}

/// `snapshot.applied`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotAppliedPayload {
    /// Page identifier
    pub page_id: Uuid,
    /// Envelopes of every live section
    pub snapshot: Vec<SnapshotEnvelope>,
    /// Remote read or local mutation
    pub source: SnapshotSource,
    /// When the snapshot was committed
    pub applied_at: DateTime<Utc>,
}

/// `section.changed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionChangedPayload {
    /// Page identifier
    pub page_id: Uuid,
    /// Section identifier
    pub section_id: Uuid,
    /// Change relative to the baseline
    pub diff: Option<DiffEnvelope>,
    /// Whether the section now differs from its baseline
    pub dirty: bool,
}

/// `section.committed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionCommittedPayload {
    /// Page identifier
    pub page_id: Uuid,
    /// Section identifier
    pub section_id: Uuid,
    /// What the server accepted
    pub diff: Option<DiffEnvelope>,
    /// When the server accepted it
    pub committed_at: DateTime<Utc>,
}

/// `section.conflicted`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionConflictPayload {
    /// Page identifier
    pub page_id: Uuid,
    /// Section identifier
    pub section_id: Uuid,
    /// Rejected local change
    pub diff: Option<DiffEnvelope>,
    /// When the conflict was detected
    pub detected_at: DateTime<Utc>,
}

/// `review.status.updated`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewStatusPayload {
    /// Page identifier
    pub page_id: Uuid,
    /// Section identifier
    pub section_id: Uuid,
    /// New verdict
    pub status: ReviewStatus,
    /// Reviewer identifier
    #[serde(default)]
    pub reviewer_id: Option<Uuid>,
    /// Reviewer display name
    #[serde(default)]
    pub reviewer_name: Option<String>,
    /// Reviewer comment
    #[serde(default)]
    pub comment: Option<String>,
    /// When the verdict was given
    pub updated_at: DateTime<Utc>,
}

/// `timeline.publish.summary`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishSummaryPayload {
    /// Page identifier
    pub page_id: Uuid,
    /// Released changes
    pub summary: PublishSummary,
    /// When the summary was prepared
    pub prepared_at: DateTime<Utc>,
}

/// `sync.telemetry`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTelemetryPayload {
    /// Page identifier
    pub page_id: Uuid,
    /// Tick duration in milliseconds
    pub duration_ms: u64,
    /// Tick outcome
    pub result: TelemetryResult,
    /// Failure description for `error` results
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Topic of a [`SyncEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTopic {
    /// `snapshot.applied`
    SnapshotApplied,
    /// `section.changed`
    SectionChanged,
    /// `section.committed`
    SectionCommitted,
    /// `section.conflicted`
    SectionConflicted,
    /// `review.status.updated`
    ReviewStatusUpdated,
    /// `timeline.publish.summary`
    PublishSummary,
    /// `sync.telemetry`
    Telemetry,
}

impl SyncTopic {
    /// Dotted topic name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SnapshotApplied => "snapshot.applied",
            Self::SectionChanged => "section.changed",
            Self::SectionCommitted => "section.committed",
            Self::SectionConflicted => "section.conflicted",
            Self::ReviewStatusUpdated => "review.status.updated",
            Self::PublishSummary => "timeline.publish.summary",
            Self::Telemetry => "sync.telemetry",
        }
    }
}

impl std::fmt::Display for SyncTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events shared between editors of the same origin.
///
/// Every payload carries the page it belongs to; subscribers drop events for
/// pages they are not tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
pub enum SyncEvent {
    /// A snapshot was committed to the store
    #[serde(rename = "snapshot.applied")]
    SnapshotApplied(SnapshotAppliedPayload),
    /// A section differs from (or returned to) its baseline
    #[serde(rename = "section.changed")]
    SectionChanged(SectionChangedPayload),
    /// The server accepted a section mutation
    #[serde(rename = "section.committed")]
    SectionCommitted(SectionCommittedPayload),
    /// The server rejected a mutation on a stale token
    #[serde(rename = "section.conflicted")]
    SectionConflicted(SectionConflictPayload),
    /// A reviewer changed a section's verdict
    #[serde(rename = "review.status.updated")]
    ReviewStatusUpdated(ReviewStatusPayload),
    /// A publish released changes
    #[serde(rename = "timeline.publish.summary")]
    PublishSummary(PublishSummaryPayload),
    /// Background reconciliation signal
    #[serde(rename = "sync.telemetry")]
    Telemetry(SyncTelemetryPayload),
}

impl SyncEvent {
    /// Get the page this event belongs to
    #[must_use]
    pub fn page_id(&self) -> Uuid {
        match self {
            Self::SnapshotApplied(p) => p.page_id,
            Self::SectionChanged(p) => p.page_id,
            Self::SectionCommitted(p) => p.page_id,
            Self::SectionConflicted(p) => p.page_id,
            Self::ReviewStatusUpdated(p) => p.page_id,
            Self::PublishSummary(p) => p.page_id,
            Self::Telemetry(p) => p.page_id,
        }
    }

    /// Get the topic of this event
    #[must_use]
    pub fn topic(&self) -> SyncTopic {
        match self {
            Self::SnapshotApplied(_) => SyncTopic::SnapshotApplied,
            Self::SectionChanged(_) => SyncTopic::SectionChanged,
            Self::SectionCommitted(_) => SyncTopic::SectionCommitted,
            Self::SectionConflicted(_) => SyncTopic::SectionConflicted,
            Self::ReviewStatusUpdated(_) => SyncTopic::ReviewStatusUpdated,
            Self::PublishSummary(_) => SyncTopic::PublishSummary,
            Self::Telemetry(_) => SyncTopic::Telemetry,
        }
    }
}

/// A published event as seen by every bus on the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    /// Unique envelope identifier
    pub id: Uuid,
    /// The event
    #[serde(flatten)]
    pub event: SyncEvent,
    /// When the event was published
    pub timestamp: DateTime<Utc>,
    /// Identifier of the publishing bus
    pub source: String,
}
