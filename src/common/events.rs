//! # Notifications
//!
//! Typed lifecycle events emitted by servers, the fleet and dispatch jobs.
//! The core only ever calls [`EventSink::publish`]; what happens to an event
//! (logging, a UI channel, nothing) is up to the sink the caller passes in.

use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::client::JobState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // ========== SERVER LIFECYCLE ==========
    ServerStarting { name: String, port: u16 },
    ServerRunning { name: String, port: u16 },
    ServerClosed { name: String, port: u16 },
    LoadUpdated { port: u16, running: usize, waiting: usize },

    // ========== TILE LIFECYCLE ==========
    TileDispatched { job: String, row: u32, column: u32, port: u16 },
    TileProcessed { job: String, row: u32, column: u32 },
    TileFailed { job: String, row: u32, column: u32, reason: String },

    // ========== IMAGE LIFECYCLE ==========
    ImagePrepared { job: String, tiles: usize },
    ImageMerged { job: String },
    ImageSaved { job: String, path: PathBuf },
    JobStateChanged { job: String, state: JobState },

    // ========== DIAGNOSTICS ==========
    Warning { message: String },
    Error { message: String },
}

/// Anything that can receive [`Event`]s.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Discards every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: Event) {}
}

/// Writes every event to the log.
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: Event) {
        match event {
            Event::Warning { message } => warn!("⚠️  {}", message),
            Event::Error { message } => error!("❌ {}", message),
            Event::LoadUpdated { .. } | Event::TileDispatched { .. } => {
                log::debug!("📣 {:?}", event)
            }
            other => info!("📣 {:?}", other),
        }
    }
}

/// Forward events into a channel; a closed receiver drops them silently.
impl EventSink for mpsc::UnboundedSender<Event> {
    fn publish(&self, event: Event) {
        let _ = self.send(event);
    }
}

pub fn null_sink() -> SharedSink {
    Arc::new(NullSink)
}
