//! Application settings
//!
//! Sync engine settings plus the operator-side session store and logging.

mod loader;

pub use loader::load_config;

use bugence_canvas::SyncConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub canvas: SyncConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Durable session storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    /// SQLite file holding baselines; empty selects the default location
    #[serde(default)]
    pub db_path: String,
}

impl SessionSettings {
    /// Resolved database path
    pub fn db_path(&self) -> PathBuf {
        if !self.db_path.trim().is_empty() {
            return PathBuf::from(&self.db_path);
        }
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bugence")
            .join("session.db")
    }
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "bugence=info,bugence_canvas=info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}
