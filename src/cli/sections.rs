//! Section commands
//!
//! Each command loads the page first so mutations run against current tokens.

use super::Commands;
use anyhow::{bail, Context, Result};
use bugence_canvas::bus::ReviewStatusPayload;
use bugence_canvas::{
    CanvasEngine, CanvasState, LoadOptions, PublishSummary, SectionCreate, SectionUpdate,
};
use chrono::Utc;
use uuid::Uuid;

/// Run a section subcommand.
pub async fn run(engine: &CanvasEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Sections {
            page,
            json,
            history,
        } => list(engine, page, json, history).await,
        Commands::Create {
            page,
            selector,
            content,
            kind,
        } => {
            load(engine, page).await?;
            let section = engine
                .create_section(
                    page,
                    SectionCreate {
                        selector,
                        content_type: Some(kind.into()),
                        content_value: content,
                        ..Default::default()
                    },
                )
                .await?;
            println!("✅ Created section {} ({})", section.id, section.section_key);
            Ok(())
        }
        Commands::Edit {
            page,
            section,
            content,
        } => {
            load(engine, page).await?;
            let saved = engine
                .update_section(page, SectionUpdate::content(section, content))
                .await?;
            println!(
                "✅ Saved section {} (token {})",
                saved.id,
                saved.etag.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        Commands::Duplicate {
            page,
            section,
            variant,
        } => {
            load(engine, page).await?;
            let copy = engine
                .duplicate_section(page, section, variant.as_deref())
                .await?;
            println!("✅ Duplicated {} as {}", section, copy.id);
            Ok(())
        }
        Commands::Delete { page, section } => {
            load(engine, page).await?;
            engine.delete_section(page, section).await?;
            println!("✅ Deleted section {}", section);
            Ok(())
        }
        Commands::Publish { page } => {
            load(engine, page).await?;
            let summary = engine.publish(page).await?;
            print_summary(&summary);
            Ok(())
        }
        Commands::Review {
            page,
            section,
            status,
            comment,
        } => {
            load(engine, page).await?;
            engine.publish_review_status(ReviewStatusPayload {
                page_id: page,
                section_id: section,
                status: status.into(),
                reviewer_id: None,
                reviewer_name: std::env::var("USER").ok(),
                comment,
                updated_at: Utc::now(),
            })?;
            println!("✅ Review status recorded for {}", section);
            Ok(())
        }
        Commands::Watch { .. } => bail!("watch is handled separately"),
    }
}

async fn load(engine: &CanvasEngine, page: Uuid) -> Result<()> {
    engine
        .load_sections(page, LoadOptions::default())
        .await
        .with_context(|| format!("Failed to load page {page}"))?;
    Ok(())
}

async fn list(engine: &CanvasEngine, page: Uuid, json: bool, history: bool) -> Result<()> {
    let state = if history {
        engine.load(page, LoadOptions::default()).await?
    } else {
        load(engine, page).await?;
        engine.state()
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&state.sections)?);
        return Ok(());
    }

    print_sections(&state);
    if history {
        println!("\nHistory ({} entries)", state.history.len());
        for entry in &state.history {
            println!(
                "  {}  {:<16} {}",
                entry.performed_at.format("%Y-%m-%d %H:%M"),
                entry.field_key,
                entry
                    .performed_by_display_name
                    .as_deref()
                    .unwrap_or(&entry.performed_by_user_id)
            );
        }
    }
    Ok(())
}

fn print_sections(state: &CanvasState) {
    let Some(page) = &state.page else {
        println!("No page loaded");
        return;
    };
    println!("📄 {} (/{})", page.name, page.slug);
    println!(
        "   page token {}  sections token {}",
        state.page_etag.as_deref().unwrap_or("-"),
        state.sections_etag.as_deref().unwrap_or("-")
    );
    println!();

    for section in &state.sections {
        let marker = if state.conflict_section_ids.contains(&section.id) {
            "!"
        } else if state.is_dirty(section.id) {
            "*"
        } else {
            " "
        };
        let preview: String = section
            .content_value
            .as_deref()
            .unwrap_or_default()
            .chars()
            .take(48)
            .collect();
        println!(
            "{} {}  {:<20} {:<9} {}",
            marker,
            section.id,
            section.section_key,
            section.content_type.as_str(),
            preview.replace('\n', " ")
        );
    }
    println!("\n{} sections, {} dirty", state.sections.len(), state.dirty_section_ids.len());
}

fn print_summary(summary: &PublishSummary) {
    if summary.is_empty() {
        println!("✅ Published, no changes since the last publish");
        return;
    }
    println!("✅ Published {} change(s)", summary.entries.len());
    for entry in &summary.entries {
        let review = entry
            .reviewer_status
            .map(|status| format!(" [{status:?}]"))
            .unwrap_or_default();
        println!(
            "  {:<8} {:<20} {}{}",
            entry.change_type.as_str(),
            entry.section_key,
            entry.section_id,
            review
        );
    }
}
