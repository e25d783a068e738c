//! Canvas Event Types
//!
//! Per-engine notifications about transitions of the local store. Unlike the
//! sync channel these never leave the engine that produced them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CanvasError;
use crate::model::Section;

/// Canvas event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanvasEventType {
    /// A snapshot was committed
    SnapshotApplied,
    /// A section appeared
    SectionAdded,
    /// A section's fields changed
    SectionUpdated,
    /// A section disappeared
    SectionRemoved,
    /// A local edit is shown before server confirmation
    SectionOptimistic,
    /// The server accepted a local edit
    SectionCommitted,
    /// The server rejected a local edit on a stale token
    SectionConflict,
    /// A local edit was rolled back after a failure
    SectionReverted,
    /// An operation failed
    Error,
}

impl CanvasEventType {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SnapshotApplied => "snapshot_applied",
            Self::SectionAdded => "section_added",
            Self::SectionUpdated => "section_updated",
            Self::SectionRemoved => "section_removed",
            Self::SectionOptimistic => "section_optimistic",
            Self::SectionCommitted => "section_committed",
            Self::SectionConflict => "section_conflict",
            Self::SectionReverted => "section_reverted",
            Self::Error => "error",
        }
    }

    /// Check if this event belongs to a mutation lifecycle
    #[must_use]
    pub fn is_mutation_event(&self) -> bool {
        matches!(
            self,
            Self::SectionOptimistic
                | Self::SectionCommitted
                | Self::SectionConflict
                | Self::SectionReverted
        )
    }
}

impl std::fmt::Display for CanvasEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A store transition notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasEvent {
    /// Unique event ID
    pub id: Uuid,
    /// Event type
    pub event_type: CanvasEventType,
    /// Page the event belongs to
    pub page_id: Uuid,
    /// Section the event refers to
    pub section_id: Option<Uuid>,
    /// Section value after the transition
    pub section: Option<Section>,
    /// Failure details for error, revert and conflict events
    pub error: Option<CanvasError>,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

impl CanvasEvent {
    /// Create a new event
    #[must_use]
    pub fn new(event_type: CanvasEventType, page_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            page_id,
            section_id: None,
            section: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach a section value
    #[must_use]
    pub fn with_section(mut self, section: Section) -> Self {
        self.section_id = Some(section.id);
        self.section = Some(section);
        self
    }

    /// Attach a section id without a value
    #[must_use]
    pub fn with_section_id(mut self, section_id: Uuid) -> Self {
        self.section_id = Some(section_id);
        self
    }

    /// Attach failure details
    #[must_use]
    pub fn with_error(mut self, error: CanvasError) -> Self {
        if self.section_id.is_none() {
            self.section_id = error.section_id;
        }
        self.error = Some(error);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_as_str() {
        assert_eq!(CanvasEventType::SectionOptimistic.as_str(), "section_optimistic");
        assert_eq!(CanvasEventType::Error.to_string(), "error");
    }

    #[test]
    fn test_mutation_events() {
        assert!(CanvasEventType::SectionConflict.is_mutation_event());
        assert!(!CanvasEventType::SnapshotApplied.is_mutation_event());
    }

    #[test]
    fn test_with_error_takes_section_id() {
        let section_id = Uuid::new_v4();
        let event = CanvasEvent::new(CanvasEventType::SectionReverted, Uuid::nil())
            .with_error(CanvasError::new("Unable to save section.").with_section(section_id));
        assert_eq!(event.section_id, Some(section_id));
    }
}
