//! # Configuration Utilities
//!
//! Configuration structures shared by the server and client binaries, loaded
//! from a single TOML file. Every field has a default so a partial file (or an
//! empty one) is valid.
//!
//! ## Example TOML
//!
//! ```toml
//! [fleet]
//! server_count = 3
//! max_servers = 8
//! start_port = 5001
//! pool_size = 4
//! registry_path = "load_info.temp"
//!
//! [server]
//! transform = "grayscale"
//!
//! [dispatch]
//! rows = 2
//! columns = 2
//! output_dir = "results"
//! ```

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::processing::Transform;

/// Load a TOML configuration file and deserialize it into the specified type.
///
/// # Example
/// ```ignore
/// let config: FleetConfig = load_config("config/fleet.toml")?;
/// ```
pub fn load_config<T>(path: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)?;
    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Complete configuration for a fleet and the jobs dispatched against it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub fleet: FleetInfo,
    pub server: ServerSettings,
    pub dispatch: DispatchSettings,
}

/// Fleet sizing and the location of the shared load registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetInfo {
    /// Servers started at boot; the fleet never shrinks below this
    pub server_count: usize,
    /// Upper bound on concurrently running servers
    pub max_servers: usize,
    /// Port of the first server; the others take the following ports
    pub start_port: u16,
    /// Executors in each server's worker pool
    pub pool_size: usize,
    /// Load registry file shared by servers and dispatchers
    pub registry_path: PathBuf,
}

impl Default for FleetInfo {
    fn default() -> Self {
        Self {
            server_count: 3,
            max_servers: 8,
            start_port: 5001,
            pool_size: 4,
            registry_path: PathBuf::from("load_info.temp"),
        }
    }
}

/// Behaviour of each compute server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub transform: Transform,
    /// How long an idle executor waits before re-checking the queue
    pub idle_recheck_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            transform: Transform::Grayscale,
            idle_recheck_ms: 100,
        }
    }
}

impl ServerSettings {
    pub fn idle_recheck(&self) -> Duration {
        Duration::from_millis(self.idle_recheck_ms)
    }
}

/// Grid shape, output location and retry budget for dispatch jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub rows: u32,
    pub columns: u32,
    pub output_dir: PathBuf,
    pub request_timeout_secs: u64,
    /// Full passes over the known servers before a tile is abandoned
    pub retry_rounds: u32,
    pub retry_delay_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            rows: 2,
            columns: 2,
            output_dir: PathBuf::from("results"),
            request_timeout_secs: 30,
            retry_rounds: 2,
            retry_delay_ms: 200,
        }
    }
}

impl DispatchSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl FleetConfig {
    /// Reject configurations the fleet cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.fleet.pool_size == 0 {
            bail!("fleet.pool_size must be at least 1");
        }
        if self.fleet.server_count > self.fleet.max_servers {
            bail!(
                "fleet.server_count ({}) exceeds fleet.max_servers ({})",
                self.fleet.server_count,
                self.fleet.max_servers
            );
        }
        let last_port = (self.fleet.start_port as usize + self.fleet.max_servers).saturating_sub(1);
        if last_port > u16::MAX as usize {
            bail!("fleet.max_servers does not fit above port {}", self.fleet.start_port);
        }
        if self.dispatch.rows == 0 || self.dispatch.columns == 0 {
            bail!("dispatch.rows and dispatch.columns must be at least 1");
        }
        if self.dispatch.retry_rounds == 0 {
            bail!("dispatch.retry_rounds must be at least 1");
        }
        Ok(())
    }
}
