//! Error types for bugence-canvas
//!
//! Validation and not-found errors are raised before any network call and
//! leave the store untouched. Network and conflict errors are raised after the
//! pipeline has already rolled the store back to the last accepted content.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Canvas error type
#[derive(Debug, Error)]
pub enum Error {
    /// Input rejected before reaching the content service
    #[error("validation failed: {0}")]
    Validation(String),

    /// No page loaded, or a different page is active
    #[error("page not loaded: {0}")]
    PageNotLoaded(Uuid),

    /// Section not present in the local snapshot
    #[error("section not found: {0}")]
    SectionNotFound(Uuid),

    /// Transport or HTTP failure
    #[error("network error: {message}")]
    Network {
        /// Message reported by the content service or transport
        message: String,
        /// HTTP status, when a response was received
        status: Option<u16>,
        /// Section the failed request targeted
        section_id: Option<Uuid>,
    },

    /// Concurrency token precondition failed
    #[error("conflict: {message}")]
    Conflict {
        /// Human readable description
        message: String,
        /// Conflicted section (None for page-level conflicts)
        section_id: Option<Uuid>,
    },

    /// A publish for this page is already running
    #[error("publish already in progress for page {0}")]
    PublishInProgress(Uuid),

    /// The response arrived after the page was switched or reset
    #[error("page {0} is no longer active")]
    Superseded(Uuid),

    /// Durable storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a storage error
    #[must_use]
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a network error
    #[must_use]
    pub fn network(msg: impl Into<String>, status: Option<u16>, section_id: Option<Uuid>) -> Self {
        Self::Network {
            message: msg.into(),
            status,
            section_id,
        }
    }

    /// Create a conflict error
    #[must_use]
    pub fn conflict(msg: impl Into<String>, section_id: Option<Uuid>) -> Self {
        Self::Conflict {
            message: msg.into(),
            section_id,
        }
    }

    /// Check if the error is a concurrency conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Check if error is recoverable by retrying or reloading
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Conflict { .. } | Self::Superseded(_)
        )
    }

    /// HTTP status carried by the error, if any
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Network { status, .. } => *status,
            Self::Conflict { .. } => Some(412),
            _ => None,
        }
    }

    /// Get error code for events and logs
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::PageNotLoaded(_) => "page_not_loaded",
            Self::SectionNotFound(_) => "section_not_found",
            Self::Network { .. } => "network_error",
            Self::Conflict { .. } => "conflict",
            Self::PublishInProgress(_) => "publish_in_progress",
            Self::Superseded(_) => "superseded",
            Self::Storage(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result type alias for canvas operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error snapshot mirrored into the store for UI observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasError {
    /// Human readable message
    pub message: String,
    /// HTTP status, if the failure came from the content service
    #[serde(default)]
    pub status: Option<u16>,
    /// Section the failure relates to
    #[serde(default)]
    pub section_id: Option<Uuid>,
}

impl CanvasError {
    /// Create an error with only a message
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            section_id: None,
        }
    }

    /// Attach an HTTP status
    #[must_use]
    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.status = status;
        self
    }

    /// Attach a section id
    #[must_use]
    pub fn with_section(mut self, section_id: Uuid) -> Self {
        self.section_id = Some(section_id);
        self
    }
}

impl From<&Error> for CanvasError {
    fn from(err: &Error) -> Self {
        let section_id = match err {
            Error::Network { section_id, .. } | Error::Conflict { section_id, .. } => *section_id,
            Error::SectionNotFound(id) => Some(*id),
            _ => None,
        };
        let message = match err {
            Error::Network { message, .. } | Error::Conflict { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            message,
            status: err.status(),
            section_id,
        }
    }
}
