//! # Dispatcher
//!
//! Owns one image job from split to saved result.
//!
//! ## Workflow
//!
//! 1. **Prepare**: `new` checks the grid against the image and splits it, so a
//!    bad grid fails before any network traffic.
//! 2. **Dispatch**: `start` spawns one [`TileWorker`] per tile plus a
//!    coordinator task.
//! 3. **Join**: the coordinator awaits every worker and writes each returned
//!    tile into its slot of the result grid.
//! 4. **Persist**: if every tile came back and the job was not cancelled, the
//!    grid is joined and saved as `<output_dir>/<name>_edited.png`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let job = Dispatcher::new("photo", image, 2, 2, registry, options, sink)?;
//! job.start();
//! let state = job.wait().await;
//! ```

use image::RgbaImage;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::worker::{TileOutcome, TileWorker};
use super::JobState;
use crate::common::config::DispatchSettings;
use crate::common::error::DispatchError;
use crate::common::events::{Event, SharedSink};
use crate::processing::{codec, Tile};
use crate::registry::LoadRegistry;

/// Output location, per-request timeout and retry budget of a job.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub output_dir: PathBuf,
    pub request_timeout: Duration,
    /// Full passes over the registered servers before a tile is abandoned
    pub retry_rounds: u32,
    pub retry_delay: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::from(&DispatchSettings::default())
    }
}

impl From<&DispatchSettings> for DispatchOptions {
    fn from(settings: &DispatchSettings) -> Self {
        Self {
            output_dir: settings.output_dir.clone(),
            request_timeout: settings.request_timeout(),
            retry_rounds: settings.retry_rounds.max(1),
            retry_delay: settings.retry_delay(),
        }
    }
}

/// Signals of the current run.
struct RunHandle {
    cancel: watch::Sender<bool>,
    coordinator: JoinHandle<()>,
}

struct Job {
    name: String,
    rows: u32,
    columns: u32,
    width: u32,
    height: u32,
    tiles: Vec<Tile>,
    registry: Arc<LoadRegistry>,
    options: Arc<DispatchOptions>,
    sink: SharedSink,
    state: watch::Sender<JobState>,
}

pub struct Dispatcher {
    job: Arc<Job>,
    run: Mutex<Option<RunHandle>>,
}

impl Dispatcher {
    /// Prepare a job over `image` split into `rows x columns` tiles.
    ///
    /// # Errors
    /// [`DispatchError::Grid`] if the grid is empty or does not divide the
    /// image evenly.
    pub fn new(
        name: impl Into<String>,
        image: RgbaImage,
        rows: u32,
        columns: u32,
        registry: Arc<LoadRegistry>,
        options: DispatchOptions,
        sink: SharedSink,
    ) -> Result<Self, DispatchError> {
        let name = name.into();
        let tiles = codec::split(&image, rows, columns)?;

        sink.publish(Event::ImagePrepared {
            job: name.clone(),
            tiles: tiles.len(),
        });
        let (state, _) = watch::channel(JobState::New);

        Ok(Self {
            job: Arc::new(Job {
                name,
                rows,
                columns,
                width: image.width(),
                height: image.height(),
                tiles,
                registry,
                options: Arc::new(options),
                sink,
                state,
            }),
            run: Mutex::new(None),
        })
    }

    /// Start dispatching. Returns `false` (and does nothing) while a previous
    /// run is still in progress.
    pub fn start(&self) -> bool {
        let mut run = self.run.lock();

        let previous_done = run.as_ref().map_or(true, |handle| handle.coordinator.is_finished());
        let state = self.state();
        if state == JobState::Running || !previous_done {
            warn!("⚠️  {} is already running", self.job.name);
            self.job.sink.publish(Event::Warning {
                message: format!("{} is already running", self.job.name),
            });
            return false;
        }

        let (cancel, cancel_rx) = watch::channel(false);
        self.job.set_state(JobState::Running);
        info!(
            "🚀 Dispatching {} as {} tile(s)",
            self.job.name,
            self.job.tiles.len()
        );

        let coordinator = tokio::spawn(coordinate(self.job.clone(), cancel_rx));
        *run = Some(RunHandle { cancel, coordinator });
        true
    }

    /// Ask every worker of the current run to stop. A job that was never
    /// started moves straight to `Cancelled`.
    pub fn cancel(&self) {
        let run = self.run.lock();
        match run.as_ref() {
            Some(handle) if self.state() == JobState::Running => {
                info!("🛑 Cancelling {}", self.job.name);
                handle.cancel.send_replace(true);
            }
            None if self.state() == JobState::New => self.job.set_state(JobState::Cancelled),
            _ => {}
        }
    }

    pub fn state(&self) -> JobState {
        *self.job.state.borrow()
    }

    /// Wait until the current run reaches a terminal state and return it.
    /// Returns immediately if the job is not running.
    pub async fn wait(&self) -> JobState {
        let mut state = self.job.state.subscribe();
        let current = state
            .wait_for(|state| *state != JobState::Running)
            .await
            .map(|state| *state);
        current.unwrap_or(JobState::Failed)
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn rows(&self) -> u32 {
        self.job.rows
    }

    pub fn columns(&self) -> u32 {
        self.job.columns
    }

    /// Where the processed image is written.
    pub fn output_path(&self) -> PathBuf {
        self.job.output_path()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(handle) = self.run.get_mut().as_ref() {
            handle.cancel.send_replace(true);
        }
    }
}

impl Job {
    fn set_state(&self, state: JobState) {
        self.state.send_replace(state);
        self.sink.publish(Event::JobStateChanged {
            job: self.name.clone(),
            state,
        });
    }

    fn output_path(&self) -> PathBuf {
        self.options.output_dir.join(format!("{}_edited.png", self.name))
    }

    /// Join the complete grid and save it.
    async fn persist(&self, grid: Vec<Option<RgbaImage>>) -> Result<PathBuf, DispatchError> {
        let (rows, columns, width, height) = (self.rows, self.columns, self.width, self.height);
        let image = tokio::task::spawn_blocking(move || codec::join(&grid, rows, columns, width, height))
            .await
            .map_err(|e| DispatchError::Aborted(e.to_string()))??;
        self.sink.publish(Event::ImageMerged {
            job: self.name.clone(),
        });

        let path = self.output_path();
        let target = path.clone();
        tokio::task::spawn_blocking(move || codec::save_png(&image, &target))
            .await
            .map_err(|e| DispatchError::Aborted(e.to_string()))?
            .map_err(|source| DispatchError::Persist {
                path: path.clone(),
                source,
            })?;

        Ok(path)
    }
}

/// Join every worker, then decide the job's final state.
async fn coordinate(job: Arc<Job>, cancel: watch::Receiver<bool>) {
    let workers: Vec<JoinHandle<_>> = job
        .tiles
        .iter()
        .map(|tile| {
            let worker = TileWorker::new(
                job.name.clone(),
                tile.clone(),
                job.registry.clone(),
                job.options.clone(),
                job.sink.clone(),
                cancel.clone(),
            );
            tokio::spawn(worker.run())
        })
        .collect();

    // Each slot is written once, by the join of the worker that owns it.
    let mut grid: Vec<Option<RgbaImage>> = vec![None; job.tiles.len()];
    let mut abandoned = 0usize;

    for worker in workers {
        match worker.await {
            Ok(result) => match result.outcome {
                TileOutcome::Processed(image) => {
                    let index = (result.row * job.columns + result.column) as usize;
                    grid[index] = Some(image);
                }
                TileOutcome::Abandoned(_) => abandoned += 1,
                TileOutcome::Cancelled => {}
            },
            Err(e) => {
                error!("❌ {} worker ended abnormally: {}", job.name, e);
                abandoned += 1;
            }
        }
    }

    let state = if *cancel.borrow() {
        JobState::Cancelled
    } else if abandoned > 0 {
        let message = format!("{}: {} tile(s) could not be processed", job.name, abandoned);
        error!("❌ {}", message);
        job.sink.publish(Event::Error { message });
        JobState::Failed
    } else {
        match job.persist(grid).await {
            Ok(path) => {
                info!("💾 {} saved to {}", job.name, path.display());
                job.sink.publish(Event::ImageSaved {
                    job: job.name.clone(),
                    path,
                });
                JobState::Completed
            }
            Err(e) => {
                error!("❌ {}: {}", job.name, e);
                job.sink.publish(Event::Error {
                    message: format!("{}: {}", job.name, e),
                });
                JobState::Failed
            }
        }
    };

    job.set_state(state);
}
