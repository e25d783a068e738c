//! Layered settings: built-in defaults, `config/*.toml` files, then
//! `BUGENCE_<SECTION>__<KEY>` environment variables

use super::AppConfig;
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};

/// Defaults compiled into the binary
pub const BUILTIN_DEFAULTS: &str = include_str!("../../config/default.toml");

const ENV_PREFIX: &str = "BUGENCE";

/// Profile selecting `config/<profile>.toml`
fn profile() -> String {
    std::env::var("BUGENCE_ENV").unwrap_or_else(|_| "development".to_string())
}

/// Resolve the application settings
pub fn load_config() -> Result<AppConfig> {
    let profile = profile();
    let mut builder =
        Config::builder().add_source(File::from_str(BUILTIN_DEFAULTS, FileFormat::Toml));
    for layer in ["default", profile.as_str(), "local"] {
        builder = builder.add_source(File::with_name(&format!("config/{layer}")).required(false));
    }

    builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|config| config.try_deserialize::<AppConfig>())
        .with_context(|| format!("Invalid settings for profile `{profile}`"))
}
