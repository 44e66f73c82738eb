//! # Fleet Manager
//!
//! Starts and stops [`ComputeServer`]s on consecutive ports, between the
//! configured boot count and the configured maximum. Uses only the servers'
//! public operations.

use log::{info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::server::ComputeServer;
use crate::common::config::{FleetInfo, ServerSettings};
use crate::common::error::{CapacityError, ServerError};
use crate::common::events::{Event, SharedSink};
use crate::pool::WorkerPool;
use crate::registry::LoadRegistry;

pub struct Fleet {
    info: FleetInfo,
    settings: ServerSettings,
    registry: Arc<LoadRegistry>,
    sink: SharedSink,
    servers: Mutex<Vec<Arc<ComputeServer>>>,
}

impl Fleet {
    pub fn new(
        info: FleetInfo,
        settings: ServerSettings,
        registry: Arc<LoadRegistry>,
        sink: SharedSink,
    ) -> Self {
        Self {
            info,
            settings,
            registry,
            sink,
            servers: Mutex::new(Vec::new()),
        }
    }

    /// Bring the fleet up to its boot size.
    pub async fn start(&self) -> Result<(), ServerError> {
        info!("🚀 Starting fleet of {} server(s)", self.info.server_count);
        while self.len().await < self.info.server_count {
            self.add_server().await?;
        }
        Ok(())
    }

    /// Start one more server on the next free port of the range.
    pub async fn add_server(&self) -> Result<Arc<ComputeServer>, ServerError> {
        let mut servers = self.servers.lock().await;
        if servers.len() >= self.info.max_servers {
            let err = CapacityError::MaxServers {
                max: self.info.max_servers,
            };
            self.warn(&err);
            return Err(err.into());
        }

        let index = servers.len();
        // The port range ends at u16::MAX whatever max_servers says.
        let Some(port) = u16::try_from(index)
            .ok()
            .and_then(|offset| self.info.start_port.checked_add(offset))
        else {
            let err = CapacityError::MaxServers { max: index };
            self.warn(&err);
            return Err(err.into());
        };

        let pool = WorkerPool::with_idle_recheck(self.info.pool_size, self.settings.idle_recheck());
        let server = Arc::new(ComputeServer::with_pool(
            format!("Server {}", index + 1),
            port,
            pool,
            self.settings.transform,
            self.registry.clone(),
            self.sink.clone(),
        ));
        server.start().await?;

        servers.push(server.clone());
        Ok(server)
    }

    /// Close the most recently added server, keeping at least the boot count.
    pub async fn remove_last_server(&self) -> Result<(), ServerError> {
        let mut servers = self.servers.lock().await;
        if servers.len() <= self.info.server_count {
            let err = CapacityError::MinServers {
                min: self.info.server_count,
            };
            self.warn(&err);
            return Err(err.into());
        }

        if let Some(server) = servers.pop() {
            server.close().await?;
        }
        Ok(())
    }

    /// Close every server, newest first. Keeps going past individual failures
    /// and returns the first one.
    pub async fn close_all(&self) -> Result<(), ServerError> {
        let mut servers = self.servers.lock().await;
        let mut first_error = None;

        while let Some(server) = servers.pop() {
            if let Err(e) = server.close().await {
                warn!("❌ Failed to close {}: {}", server.name(), e);
                first_error.get_or_insert(e);
            }
        }

        info!("🛑 Fleet stopped");
        first_error.map_or(Ok(()), Err)
    }

    pub async fn servers(&self) -> Vec<Arc<ComputeServer>> {
        self.servers.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.servers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn warn(&self, err: &CapacityError) {
        warn!("⚠️  {}", err);
        self.sink.publish(Event::Warning {
            message: err.to_string(),
        });
    }
}
