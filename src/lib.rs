pub mod client;
pub mod common;
pub mod pool;
pub mod processing;
pub mod registry;
pub mod server;

pub use client::{Dispatcher, JobManager, JobState};
pub use registry::LoadRegistry;
pub use server::{ComputeServer, Fleet};
