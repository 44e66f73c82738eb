//! # Client Components
//!
//! The client side of the fleet is split into three parts:
//!
//! ## Job Manager ([`manager`])
//! Holds dispatch jobs by name and starts, cancels or removes them one at a
//! time or all together.
//!
//! ## Dispatcher ([`dispatcher`])
//! Owns one image job: splits the image, starts one worker per tile, joins
//! them all, then reassembles and persists the result.
//!
//! ## Tile Worker ([`worker`])
//! Routes a single tile to the least-loaded compute server, retries against
//! the others on failure and hands the processed tile back to the dispatcher.

pub mod dispatcher;
pub mod manager;
pub mod worker;

pub use dispatcher::{DispatchOptions, Dispatcher};
pub use manager::JobManager;
pub use worker::{TileOutcome, TileResult, TileWorker};

/// Lifecycle of a dispatch job.
///
/// ```text
/// New -> Running -> Completed | Cancelled | Failed
/// ```
/// A job in a terminal state may be started again once all of its workers
/// have finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    New,
    Running,
    Completed,
    Cancelled,
    /// At least one tile was abandoned or the result could not be saved
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed)
    }
}
