//! # Load Registry
//!
//! Shared record of each compute server's running/waiting task counts.

#[allow(clippy::module_inception)]
pub mod registry;

pub use registry::{LoadEntry, LoadRegistry};
