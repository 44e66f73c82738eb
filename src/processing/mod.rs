//! # Image Processing
//!
//! Splitting, joining, encoding and transforming images. Everything here is
//! synchronous and CPU-bound; async callers run it on the blocking pool.

pub mod codec;

// Re-export main types for convenience
pub use codec::{Tile, Transform};
