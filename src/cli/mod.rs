//! CLI module for Bugence
//!
//! Operator commands against the content service:
//! - `sections`: Load a page and list its sections with their sync state
//! - `create` / `edit` / `duplicate` / `delete`: Section mutations
//! - `publish`: Publish a page and print the released changes
//! - `review`: Record a reviewer verdict
//! - `watch`: Keep a page in sync and log channel traffic

use anyhow::{Context, Result};
use bugence_canvas::{
    BaselineCache, CanvasEngine, ContentType, HttpContentApi, ReviewStatus, SqliteKvStore, SyncBus,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::settings::AppConfig;

pub mod sections;
pub mod watch;

/// Bugence canvas sync CLI
#[derive(Parser, Debug)]
#[command(name = "bugence")]
#[command(about = "Canvas content sync for the Bugence page editor")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the sections of a page
    Sections {
        /// Page identifier
        #[arg(long)]
        page: Uuid,
        /// Print the sections as JSON
        #[arg(long)]
        json: bool,
        /// Include the content change log
        #[arg(long)]
        history: bool,
    },
    /// Create a section
    Create {
        #[arg(long)]
        page: Uuid,
        /// CSS selector the section binds to
        #[arg(long)]
        selector: String,
        /// Initial content
        #[arg(long)]
        content: Option<String>,
        #[arg(long, value_enum, default_value_t = ContentKind::RichText)]
        kind: ContentKind,
    },
    /// Change the content of a section
    Edit {
        #[arg(long)]
        page: Uuid,
        #[arg(long)]
        section: Uuid,
        #[arg(long)]
        content: String,
    },
    /// Copy a section under the same selector
    Duplicate {
        #[arg(long)]
        page: Uuid,
        #[arg(long)]
        section: Uuid,
        /// Variant label appended to the copied content
        #[arg(long)]
        variant: Option<String>,
    },
    /// Delete a section
    Delete {
        #[arg(long)]
        page: Uuid,
        #[arg(long)]
        section: Uuid,
    },
    /// Publish a page
    Publish {
        #[arg(long)]
        page: Uuid,
    },
    /// Record a reviewer verdict for a section
    Review {
        #[arg(long)]
        page: Uuid,
        #[arg(long)]
        section: Uuid,
        #[arg(long, value_enum)]
        status: ReviewVerdict,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Keep a page in sync until interrupted
    Watch {
        #[arg(long)]
        page: Uuid,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ContentKind {
    Text,
    Html,
    Image,
    RichText,
}

impl From<ContentKind> for ContentType {
    fn from(kind: ContentKind) -> Self {
        match kind {
            ContentKind::Text => ContentType::Text,
            ContentKind::Html => ContentType::Html,
            ContentKind::Image => ContentType::Image,
            ContentKind::RichText => ContentType::RichText,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ReviewVerdict {
    Pending,
    Approved,
    Rejected,
}

impl From<ReviewVerdict> for ReviewStatus {
    fn from(verdict: ReviewVerdict) -> Self {
        match verdict {
            ReviewVerdict::Pending => ReviewStatus::Pending,
            ReviewVerdict::Approved => ReviewStatus::Approved,
            ReviewVerdict::Rejected => ReviewStatus::Rejected,
        }
    }
}

/// Build an engine over the HTTP content service and the session database
pub async fn build_engine(config: &AppConfig) -> Result<CanvasEngine> {
    let db_path = config.session.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create session directory")?;
    }
    let store = SqliteKvStore::open(&db_path)
        .await
        .with_context(|| format!("Failed to open session store at {}", db_path.display()))?;
    debug!(path = %db_path.display(), "Session store opened");

    let canvas = &config.canvas;
    let api = HttpContentApi::new(canvas).context("Failed to build HTTP client")?;
    let bus = SyncBus::open(&canvas.channel_name, canvas.event_capacity);
    let baseline = BaselineCache::new(Arc::new(store), canvas.baseline_storage_key.clone());

    Ok(CanvasEngine::new(Arc::new(api), bus, baseline, canvas.clone()))
}

/// Run the CLI command
pub async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    let Some(command) = cli.command else {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    };

    let engine = build_engine(&config).await?;
    match command {
        Commands::Watch { page } => watch::run(&engine, page).await,
        command => sections::run(&engine, command).await,
    }
}

/// Log a failed command, with the engine's error code when there is one
pub fn report_error(err: &anyhow::Error) {
    let Some(canvas) = err.downcast_ref::<bugence_canvas::Error>() else {
        error!(error = %format!("{err:#}"), "Command failed");
        return;
    };
    error!(
        code = canvas.code(),
        status = ?canvas.status(),
        recoverable = canvas.is_recoverable(),
        error = %format!("{err:#}"),
        "Command failed"
    );
    if canvas.is_recoverable() {
        eprintln!("⚠️  {canvas}; the command can be retried");
    }
}
