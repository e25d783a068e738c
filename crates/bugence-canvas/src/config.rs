//! Sync engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Default path prefix of the content API
pub const DEFAULT_CONTENT_BASE: &str = "/api/content";

/// Default reconcile interval in seconds
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 15;

/// Reconcile interval floor in seconds
pub const MIN_SYNC_INTERVAL_SECS: u64 = 5;

/// Default name of the shared sync channel
pub const DEFAULT_CHANNEL_NAME: &str = "bugence:sync";

/// Default broadcast capacity of the sync channel and canvas events
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default durable key for baseline records
pub const DEFAULT_BASELINE_STORAGE_KEY: &str = "bugence:canvas:baseline";

/// Default HTTP timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Origin of the content service, e.g. `http://localhost:5000`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path prefix of the content API (default: /api/content)
    #[serde(default = "default_content_base")]
    pub content_base: String,

    /// Reconcile interval in seconds (default: 15, floor: 5)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Name of the cross-instance sync channel
    #[serde(default = "default_channel_name")]
    pub channel_name: String,

    /// Broadcast buffer size
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Durable key under which baselines are persisted
    #[serde(default = "default_baseline_storage_key")]
    pub baseline_storage_key: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_content_base() -> String {
    DEFAULT_CONTENT_BASE.to_string()
}

fn default_sync_interval() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}

fn default_channel_name() -> String {
    DEFAULT_CHANNEL_NAME.to_string()
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_baseline_storage_key() -> String {
    DEFAULT_BASELINE_STORAGE_KEY.to_string()
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            content_base: default_content_base(),
            sync_interval_secs: default_sync_interval(),
            channel_name: default_channel_name(),
            event_capacity: default_event_capacity(),
            baseline_storage_key: default_baseline_storage_key(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl SyncConfig {
    /// Set the content service origin
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the reconcile interval in seconds
    #[must_use]
    pub fn with_sync_interval_secs(mut self, secs: u64) -> Self {
        self.sync_interval_secs = secs;
        self
    }

    /// Set the sync channel name
    #[must_use]
    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    /// Reconcile interval, never shorter than five seconds
    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(MIN_SYNC_INTERVAL_SECS))
    }

    /// HTTP request timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Content API root, without a trailing slash
    #[must_use]
    pub fn api_root(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.content_base.trim_matches('/')
        )
    }
}
