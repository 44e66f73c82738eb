//! # Common Components
//!
//! Shared utilities and data structures used by both client and server components.
//!
//! ## Modules
//!
//! - [`messages`]: Request/response definitions for the tile protocol
//! - [`connection`]: TCP connection abstraction with message framing
//! - [`config`]: Configuration structures and TOML loading
//! - [`error`]: Typed failures for each layer
//! - [`events`]: Lifecycle notifications and sinks

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod messages;
