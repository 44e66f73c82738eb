//! # Compute Server
//!
//! A TCP listener that turns every accepted connection into a
//! [`Session`](super::session::Session) task for its worker pool and keeps its
//! entry in the shared [`LoadRegistry`] current.
//!
//! ## Lifecycle
//!
//! ```text
//! start():  bind 127.0.0.1:<port> -> add_entry(port, 0, 0) -> accept loop + pool
//! close():  stop accepting -> pause pool -> wait for drain -> remove_entry(port)
//! ```
//!
//! ## Load Publishing
//!
//! The worker pool reports every enqueue, dequeue and completion through its
//! load listener into a `watch` channel. A publisher task turns the latest
//! value into a registry `update`, so bursts of events coalesce into one write.
//! Each accepted connection goes through `add_task` and is therefore published
//! as well.

use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::session::Session;
use crate::common::error::{CapacityError, ServerError};
use crate::common::events::{Event, SharedSink};
use crate::pool::{PoolLoad, WorkerPool};
use crate::processing::Transform;
use crate::registry::LoadRegistry;

/// Tasks and signals that exist only while the server is open.
struct Running {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    publisher_task: JoinHandle<()>,
}

pub struct ComputeServer {
    name: String,
    port: u16,
    transform: Transform,
    pool: Arc<WorkerPool>,
    registry: Arc<LoadRegistry>,
    sink: SharedSink,
    running: Mutex<Option<Running>>,
}

impl ComputeServer {
    /// Create a closed server.
    ///
    /// # Arguments
    /// - `name`: label used in logs and events
    /// - `port`: listening port, also the server's registry id
    /// - `capacity`: number of worker pool executors
    /// - `transform`: pixel transform applied to every tile
    pub fn new(
        name: impl Into<String>,
        port: u16,
        capacity: usize,
        transform: Transform,
        registry: Arc<LoadRegistry>,
        sink: SharedSink,
    ) -> Self {
        Self::with_pool(name, port, WorkerPool::new(capacity), transform, registry, sink)
    }

    pub fn with_pool(
        name: impl Into<String>,
        port: u16,
        pool: WorkerPool,
        transform: Transform,
        registry: Arc<LoadRegistry>,
        sink: SharedSink,
    ) -> Self {
        Self {
            name: name.into(),
            port,
            transform,
            pool: Arc::new(pool),
            registry,
            sink,
            running: Mutex::new(None),
        }
    }

    /// Bind the socket, register with the load registry and start serving.
    ///
    /// Has no effect if the server is already open. A bind failure is returned
    /// and leaves the registry untouched.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("{} already running on {}", self.name, self.port);
            return Ok(());
        }

        self.sink.publish(Event::ServerStarting {
            name: self.name.clone(),
            port: self.port,
        });

        let listener = TcpListener::bind(("127.0.0.1", self.port))
            .await
            .map_err(|source| ServerError::Bind {
                port: self.port,
                source,
            })?;

        self.registry.add_entry(self.port, 0, 0).await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (load_tx, load_rx) = watch::channel(PoolLoad::default());
        self.pool.set_load_listener(Arc::new(move |load| {
            load_tx.send_replace(load);
        }));

        let publisher_task = tokio::spawn(publish_loads(
            self.port,
            self.registry.clone(),
            self.sink.clone(),
            load_rx,
            shutdown_rx.clone(),
        ));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.port,
            self.transform,
            self.pool.clone(),
            shutdown_rx,
        ));
        self.pool.start();

        *running = Some(Running {
            shutdown,
            accept_task,
            publisher_task,
        });

        info!("📡 {} listening on 127.0.0.1:{}", self.name, self.port);
        self.sink.publish(Event::ServerRunning {
            name: self.name.clone(),
            port: self.port,
        });
        Ok(())
    }

    /// Stop accepting, let running sessions finish and leave the registry.
    ///
    /// Connections still waiting for an executor are closed without being
    /// served. Has no effect if the server is not open.
    pub async fn close(&self) -> Result<(), ServerError> {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            return Ok(());
        };

        info!("🛑 {} closing", self.name);
        run.shutdown.send_replace(true);
        if let Err(e) = run.accept_task.await {
            error!("❌ {} accept loop ended abnormally: {}", self.name, e);
        }

        self.pool.pause();
        self.pool.wait_until_paused().await;
        let dropped = self.pool.clear_queue();
        if dropped > 0 {
            info!("{} dropped {} queued connection(s)", self.name, dropped);
        }

        if let Err(e) = run.publisher_task.await {
            error!("❌ {} load publisher ended abnormally: {}", self.name, e);
        }
        self.registry.remove_entry(self.port).await?;

        info!("✅ {} closed", self.name);
        self.sink.publish(Event::ServerClosed {
            name: self.name.clone(),
            port: self.port,
        });
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn add_executor(&self) {
        self.pool.add_executors(1);
    }

    pub fn remove_executor(&self) -> Result<(), CapacityError> {
        self.pool.remove_executors(1).inspect_err(|e| {
            self.sink.publish(Event::Warning {
                message: format!("{}: {}", self.name, e),
            });
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of executors.
    pub fn capacity(&self) -> usize {
        self.pool.size()
    }

    pub fn load(&self) -> PoolLoad {
        self.pool.load()
    }
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    transform: Transform,
    pool: Arc<WorkerPool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    debug!("🔗 Server {} accepted connection from {}", port, addr);
                    let session = Session::new(socket, addr, port, transform, shutdown.clone());
                    // add_task reports the new load to the registry publisher
                    pool.add_task(Arc::new(session));
                }
                Err(e) => {
                    error!("❌ Server {} accept error: {}", port, e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    debug!("Server {} stopped accepting", port);
}

async fn publish_loads(
    port: u16,
    registry: Arc<LoadRegistry>,
    sink: SharedSink,
    mut loads: watch::Receiver<PoolLoad>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = loads.changed() => {
                if changed.is_err() {
                    break;
                }
                let load = *loads.borrow_and_update();
                match registry.update(port, load.running, load.waiting).await {
                    Ok(()) => sink.publish(Event::LoadUpdated {
                        port,
                        running: load.running,
                        waiting: load.waiting,
                    }),
                    Err(e) => error!("❌ Server {} could not publish its load: {}", port, e),
                }
            }
        }
    }
}
