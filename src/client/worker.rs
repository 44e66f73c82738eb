//! # Tile Worker
//!
//! Carries one tile of a dispatch job to a compute server and back.
//!
//! ## Routing and Retry
//!
//! Each attempt asks the [`LoadRegistry`] for the least-loaded server the
//! worker has not already failed against in the current round. When every
//! registered server has failed (or none is registered) the round ends: the
//! worker sleeps for the retry delay plus jitter and starts a new round with a
//! clean slate. After `retry_rounds` rounds the tile is abandoned.
//!
//! ```text
//! round 1:  A fails -> B fails -> no server left -> sleep
//! round 2:  A fails -> B fails -> no server left -> abandon
//! ```
//!
//! ## Cancellation
//!
//! The job's cancel signal is checked before every attempt and also races the
//! exchange itself, so a worker blocked on a slow server stops promptly.

use image::RgbaImage;
use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::dispatcher::DispatchOptions;
use crate::common::connection::Connection;
use crate::common::error::ExchangeError;
use crate::common::events::{Event, SharedSink};
use crate::common::messages::{correlation_text, Request, Response};
use crate::processing::{codec, Tile};
use crate::registry::LoadRegistry;

/// What happened to one tile.
#[derive(Debug)]
pub enum TileOutcome {
    Processed(RgbaImage),
    Abandoned(String),
    Cancelled,
}

/// A worker's result, handed back to the dispatcher on join.
#[derive(Debug)]
pub struct TileResult {
    pub row: u32,
    pub column: u32,
    pub outcome: TileOutcome,
}

pub struct TileWorker {
    job: String,
    tile: Tile,
    registry: Arc<LoadRegistry>,
    options: Arc<DispatchOptions>,
    sink: SharedSink,
    cancel: watch::Receiver<bool>,
}

impl TileWorker {
    pub fn new(
        job: impl Into<String>,
        tile: Tile,
        registry: Arc<LoadRegistry>,
        options: Arc<DispatchOptions>,
        sink: SharedSink,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            job: job.into(),
            tile,
            registry,
            options,
            sink,
            cancel,
        }
    }

    pub async fn run(mut self) -> TileResult {
        let outcome = self.dispatch().await;

        match &outcome {
            TileOutcome::Processed(_) => self.sink.publish(Event::TileProcessed {
                job: self.job.clone(),
                row: self.tile.row,
                column: self.tile.column,
            }),
            TileOutcome::Abandoned(reason) => {
                warn!(
                    "❌ {} tile ({}, {}) abandoned: {}",
                    self.job, self.tile.row, self.tile.column, reason
                );
                self.sink.publish(Event::TileFailed {
                    job: self.job.clone(),
                    row: self.tile.row,
                    column: self.tile.column,
                    reason: reason.clone(),
                });
            }
            TileOutcome::Cancelled => {
                debug!("{} tile ({}, {}) cancelled", self.job, self.tile.row, self.tile.column)
            }
        }

        TileResult {
            row: self.tile.row,
            column: self.tile.column,
            outcome,
        }
    }

    async fn dispatch(&mut self) -> TileOutcome {
        let payload = match codec::encode_png(&self.tile.image) {
            Ok(bytes) => bytes,
            Err(e) => return TileOutcome::Abandoned(format!("could not encode tile: {}", e)),
        };
        let correlation = correlation_text(&self.job, self.tile.row, self.tile.column);

        let mut failed: HashSet<u16> = HashSet::new();
        let mut round = 1;
        let mut last_error = String::from("no server registered");

        loop {
            if *self.cancel.borrow() {
                return TileOutcome::Cancelled;
            }

            let port = match self.registry.least_loaded_excluding(&failed).await {
                Ok(Some(port)) => port,
                Ok(None) => {
                    if round >= self.options.retry_rounds {
                        return TileOutcome::Abandoned(format!(
                            "gave up after {} round(s), last error: {}",
                            round, last_error
                        ));
                    }
                    round += 1;
                    failed.clear();
                    if !self.backoff().await {
                        return TileOutcome::Cancelled;
                    }
                    continue;
                }
                Err(e) => return TileOutcome::Abandoned(format!("load registry unavailable: {}", e)),
            };

            self.sink.publish(Event::TileDispatched {
                job: self.job.clone(),
                row: self.tile.row,
                column: self.tile.column,
                port,
            });

            let attempt = exchange(port, &correlation, payload.clone(), self.options.request_timeout);
            let result = tokio::select! {
                result = attempt => result,
                _ = wait_cancelled(&mut self.cancel) => return TileOutcome::Cancelled,
            };

            match result {
                Ok(image) => {
                    info!("✅ {} processed by server {}", correlation, port);
                    return TileOutcome::Processed(image);
                }
                Err(e) => {
                    warn!("⚠️  {} failed on server {} (round {}): {}", correlation, port, round, e);
                    last_error = e.to_string();
                    failed.insert(port);
                }
            }
        }
    }

    /// Sleep between rounds. Returns `false` if the job was cancelled meanwhile.
    async fn backoff(&mut self) -> bool {
        let base = self.options.retry_delay;
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        let delay = base + Duration::from_millis(jitter_ms);

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = wait_cancelled(&mut self.cancel) => false,
        }
    }
}

/// Resolves once `cancel` reads `true`. Never resolves if the sender is gone
/// without having cancelled.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    let cancelled = cancel.wait_for(|cancelled| *cancelled).await.is_ok();
    if !cancelled {
        std::future::pending::<()>().await;
    }
}

/// Send one tile to the server on `port` and decode the processed tile.
///
/// The whole exchange, connect included, is bounded by `timeout`.
pub async fn exchange(
    port: u16,
    correlation: &str,
    payload: Vec<u8>,
    timeout: Duration,
) -> Result<RgbaImage, ExchangeError> {
    let response = tokio::time::timeout(timeout, request(port, correlation, payload))
        .await
        .map_err(|_| ExchangeError::Timeout {
            port,
            secs: timeout.as_secs(),
        })??;

    if !response.is_ok() {
        return Err(ExchangeError::Rejected {
            port,
            status: response.status,
            message: response.message,
        });
    }
    if response.message != correlation {
        return Err(ExchangeError::Mismatch {
            port,
            expected: correlation.to_string(),
            received: response.message,
        });
    }

    codec::decode(&response.image).map_err(|source| ExchangeError::Decode { port, source })
}

async fn request(port: u16, correlation: &str, payload: Vec<u8>) -> Result<Response, ExchangeError> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|source| ExchangeError::Connect { port, source })?;
    let mut conn = Connection::new(stream);

    conn.write_message(&Request::process(correlation, payload))
        .await
        .map_err(|source| ExchangeError::Protocol { port, source })?;

    let response = conn
        .read_message::<Response>()
        .await
        .map_err(|source| ExchangeError::Protocol { port, source })?
        .ok_or(ExchangeError::Closed { port })?;

    let _ = conn.shutdown().await;
    Ok(response)
}
