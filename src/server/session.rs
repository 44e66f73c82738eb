//! # Client Session
//!
//! One accepted connection, wrapped as a [`PoolTask`] so it only runs when the
//! server's worker pool has a free executor.
//!
//! A session answers requests until the client closes the stream, a frame
//! cannot be read, or the server shuts down between two requests. A request
//! whose frame is fine but whose payload cannot be processed gets an `ERROR`
//! response and the session keeps serving.

use anyhow::{bail, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::common::connection::Connection;
use crate::common::messages::{Request, Response, REQUEST_PROCESS, STATUS_ERROR};
use crate::pool::{PoolTask, TaskFuture};
use crate::processing::{codec, Transform};

pub struct Session {
    stream: Mutex<Option<TcpStream>>,
    peer: SocketAddr,
    port: u16,
    transform: Transform,
    shutdown: watch::Receiver<bool>,
}

impl Session {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        port: u16,
        transform: Transform,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            peer,
            port,
            transform,
            shutdown,
        }
    }

    async fn serve(&self) {
        let Some(stream) = self.stream.lock().take() else {
            return;
        };
        let mut conn = Connection::new(stream);
        let mut shutdown = self.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                debug!("Server {} closing session with {}", self.port, self.peer);
                break;
            }

            let next = tokio::select! {
                read = conn.read_message::<Request>() => read,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match next {
                Ok(Some(request)) => {
                    let response = self.handle_request(request).await;
                    if let Err(e) = conn.write_message(&response).await {
                        warn!("❌ Server {} failed to answer {}: {}", self.port, self.peer, e);
                        break;
                    }
                }
                Ok(None) => {
                    debug!("🔌 Server {} connection from {} closed", self.port, self.peer);
                    break;
                }
                Err(e) => {
                    warn!(
                        "❌ Server {} dropping connection from {}: {}",
                        self.port, self.peer, e
                    );
                    break;
                }
            }
        }

        let _ = conn.shutdown().await;
    }

    async fn handle_request(&self, request: Request) -> Response {
        let Request { kind, message, image } = request;

        match process_tile(self.transform, kind, image).await {
            Ok(processed) => {
                debug!("Server {} processed '{}'", self.port, message);
                Response::ok(message, processed)
            }
            Err(e) => {
                warn!("⚠️  Server {} rejected '{}': {}", self.port, message, e);
                Response {
                    status: STATUS_ERROR.to_string(),
                    message: format!("{}: {}", message, e),
                    image: Vec::new(),
                }
            }
        }
    }
}

impl PoolTask for Session {
    fn run(self: Arc<Self>) -> TaskFuture {
        Box::pin(async move {
            info!("📷 Server {} serving {}", self.port, self.peer);
            self.serve().await;
        })
    }

    fn label(&self) -> String {
        format!("session {} on {}", self.peer, self.port)
    }
}

/// Decode a tile, apply `transform` and re-encode it as PNG.
///
/// Runs on the blocking pool since pixel work is CPU-bound.
pub async fn process_tile(transform: Transform, kind: String, image: Vec<u8>) -> Result<Vec<u8>> {
    if kind != REQUEST_PROCESS {
        bail!("unsupported request type '{}'", kind);
    }

    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let tile = codec::decode(&image)?;
        Ok(codec::encode_png(&transform.apply(&tile))?)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Transform task panicked: {}", e))?
}
