//! # Worker Pool
//!
//! Generic bounded-concurrency executor used by compute servers to serve
//! client sessions.

#[allow(clippy::module_inception)]
pub mod pool;
pub mod task;

pub use pool::{LoadListener, PoolLoad, WorkerPool, DEFAULT_IDLE_RECHECK};
pub use task::{PoolTask, TaskFuture, TaskRef};
