//! `bugence watch` - keep a page in sync and log channel traffic until Ctrl-C

use anyhow::{Context, Result};
use bugence_canvas::{CanvasEngine, LoadOptions, SyncEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

pub async fn run(engine: &CanvasEngine, page: Uuid) -> Result<()> {
    let mut channel = engine.bus().subscribe();
    let mut events = engine.subscribe_events();

    let state = engine
        .load(page, LoadOptions::default())
        .await
        .with_context(|| format!("Failed to load page {page}"))?;
    info!(
        page_id = %page,
        sections = state.sections.len(),
        interval_secs = engine.config().sync_interval().as_secs(),
        "Watching page, press Ctrl-C to stop"
    );

    loop {
        tokio::select! {
            received = channel.recv() => match received {
                Ok(envelope) => log_envelope(&envelope.event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Sync channel lagged"),
                Err(RecvError::Closed) => break,
            },
            received = events.recv() => match received {
                Ok(event) => info!(
                    event = %event.event_type,
                    section_id = ?event.section_id,
                    error = ?event.error.as_ref().map(|e| e.message.as_str()),
                    "Store event"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Store events lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    engine.stop_sync_worker();
    Ok(())
}

fn log_envelope(event: &SyncEvent) {
    match event {
        SyncEvent::Telemetry(payload) => info!(
            topic = %event.topic(),
            result = ?payload.result,
            duration_ms = payload.duration_ms,
            error = ?payload.error_message,
            "Sync tick"
        ),
        SyncEvent::SectionChanged(payload) => info!(
            topic = %event.topic(),
            section_id = %payload.section_id,
            dirty = payload.dirty,
            change = ?payload.diff.as_ref().map(|d| d.change_type),
            "Section changed"
        ),
        other => info!(topic = %other.topic(), page_id = %other.page_id(), "Channel event"),
    }
}
