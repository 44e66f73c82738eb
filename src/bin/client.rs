//! # Client Binary Entry Point
//!
//! Dispatches one or more images to the running fleet and waits for the
//! results.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin tile-client -- --config config/fleet.toml --image photo.png
//! cargo run --bin tile-client -- --config config/fleet.toml --image photo.png \
//!   --image other.png --rows 4 --columns 4
//! ```
//!
//! The client will:
//! 1. Load the configuration and open the shared load registry
//! 2. Split each image into the requested grid, one named job per image
//! 3. Send every tile to the least-loaded server, retrying on failure
//! 4. Save the reassembled image as `<output_dir>/<name>_edited.png`
//!
//! The process exits non-zero unless every job completes. Ctrl-C cancels them.

use anyhow::{bail, Context};
use clap::Parser;
use env_logger::Builder;
use log::{info, warn, LevelFilter};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tile_fleet::client::{DispatchOptions, Dispatcher, JobManager, JobState};
use tile_fleet::common::config::{load_config, FleetConfig};
use tile_fleet::common::events::{LogSink, SharedSink};
use tile_fleet::processing::codec;
use tile_fleet::registry::LoadRegistry;

/// Command-line arguments for the client binary
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the fleet configuration file (TOML format)
    #[arg(short, long)]
    config: String,

    /// Image to process; repeat to run several jobs at once
    #[arg(short, long, required = true)]
    image: Vec<PathBuf>,

    /// Grid rows, overriding `dispatch.rows`
    #[arg(long)]
    rows: Option<u32>,

    /// Grid columns, overriding `dispatch.columns`
    #[arg(long)]
    columns: Option<u32>,

    /// Output directory, overriding `dispatch.output_dir`
    #[arg(long)]
    output_dir: Option<PathBuf>,
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
    if let Some(rows) = args.rows {
        config.dispatch.rows = rows;
    }
    if let Some(columns) = args.columns {
        config.dispatch.columns = columns;
    }
    if let Some(dir) = args.output_dir {
        config.dispatch.output_dir = dir;
    }
    config.validate()?;

    let registry = Arc::new(LoadRegistry::open(&config.fleet.registry_path).await?);
    let sink: SharedSink = Arc::new(LogSink);
    let options = DispatchOptions::from(&config.dispatch);
    let jobs = JobManager::new(sink.clone());

    for path in &args.image {
        let image = codec::read_image(path).with_context(|| format!("failed to read {}", path.display()))?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        jobs.add(Dispatcher::new(
            name,
            image,
            config.dispatch.rows,
            config.dispatch.columns,
            registry.clone(),
            options.clone(),
            sink.clone(),
        )?)?;
    }

    jobs.start_all();
    let wait_all = async {
        for job in jobs.jobs() {
            job.wait().await;
        }
    };
    tokio::select! {
        _ = wait_all => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("🛑 Interrupted, cancelling {} job(s)", jobs.cancel_all());
            for job in jobs.jobs() {
                job.wait().await;
            }
        }
    }

    let mut unfinished = Vec::new();
    for job in jobs.jobs() {
        match job.state() {
            JobState::Completed => info!("✅ Result written to {}", job.output_path().display()),
            other => unfinished.push(format!("{} ({:?})", job.name(), other)),
        }
    }
    if !unfinished.is_empty() {
        bail!("unfinished job(s): {}", unfinished.join(", "));
    }
    Ok(())
}
