//! # Server Binary Entry Point
//!
//! Starts a fleet of compute servers and keeps it running until Ctrl-C.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin tile-server -- --config config/fleet.toml
//! ```
//!
//! The binary will:
//! 1. Load the fleet configuration from the specified TOML file
//! 2. Open (or create) the shared load registry
//! 3. Start `server_count` compute servers on consecutive ports
//! 4. On Ctrl-C, close every server and remove it from the registry

use clap::Parser;
use env_logger::Builder;
use log::{info, LevelFilter};
use std::io::Write;
use std::sync::Arc;

use tile_fleet::common::config::{load_config, FleetConfig};
use tile_fleet::common::events::LogSink;
use tile_fleet::registry::LoadRegistry;
use tile_fleet::server::Fleet;

/// Command-line arguments for the server binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the fleet configuration file (TOML format)
    ///
    /// Example: config/fleet.toml
    #[arg(short, long)]
    config: String,

    /// Number of servers to start, overriding `fleet.server_count`
    #[arg(long)]
    servers: Option<usize>,
}

/// Initialize the logging system with timestamp, level, and message formatting.
///
/// INFO by default; `RUST_LOG` overrides it.
/// Format: `[HH:MM:SS] [LEVEL] message`
fn init_logger() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();
    let mut config: FleetConfig = load_config(&args.config)?;
    if let Some(servers) = args.servers {
        config.fleet.server_count = servers;
    }
    config.validate()?;

    let registry = Arc::new(LoadRegistry::open(&config.fleet.registry_path).await?);
    info!("📒 Load registry at {}", registry.path().display());

    let fleet = Fleet::new(config.fleet, config.server, registry, Arc::new(LogSink));
    if let Err(e) = fleet.start().await {
        fleet.close_all().await?;
        return Err(e.into());
    }

    info!("✅ Fleet ready, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    fleet.close_all().await?;
    Ok(())
}
