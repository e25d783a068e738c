//! Bugence - canvas content sync
//!
//! CLI entry point for operating on page sections.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod settings;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = settings::load_config()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.filter.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let cli = cli::Cli::parse();
    debug!(
        version = env!("CARGO_PKG_VERSION"),
        base_url = %config.canvas.base_url,
        "Starting Bugence"
    );

    let result = cli::run(cli, config).await;
    if let Err(err) = &result {
        cli::report_error(err);
    }
    result
}
