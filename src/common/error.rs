//! # Error Types
//!
//! Typed failures for every layer of the fleet. Each enum maps to one class of
//! failure with its own handling rule:
//!
//! | Type | Raised by | Handling |
//! |------|-----------|----------|
//! | [`ProtocolError`] | frame codec | drop that connection only |
//! | [`ExchangeError`] | dispatch worker | retry another server, then abandon the tile |
//! | [`GridError`] | split / join | fatal before any task starts |
//! | [`CapacityError`] | fleet, pool resize | no-op plus a warning |
//! | [`RegistryError`] | load registry | returned to the caller |
//!
//! Binaries wrap these in `anyhow::Error` at the top level.

use std::path::PathBuf;
use thiserror::Error;

/// A frame on the wire could not be read or decoded.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error on connection: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One request/response exchange with a single compute server failed.
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("could not connect to server {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol failure talking to server {port}: {source}")]
    Protocol {
        port: u16,
        #[source]
        source: ProtocolError,
    },

    #[error("server {port} closed the connection before responding")]
    Closed { port: u16 },

    #[error("server {port} did not answer within {secs}s")]
    Timeout { port: u16, secs: u64 },

    #[error("server {port} answered '{received}' to request '{expected}'")]
    Mismatch {
        port: u16,
        expected: String,
        received: String,
    },

    #[error("server {port} reported status {status}: {message}")]
    Rejected {
        port: u16,
        status: String,
        message: String,
    },

    #[error("server {port} returned an undecodable tile: {source}")]
    Decode {
        port: u16,
        #[source]
        source: image::ImageError,
    },
}

/// The grid does not fit the image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("grid dimensions must be >= 1 (got {rows}x{columns})")]
    EmptyGrid { rows: u32, columns: u32 },

    #[error("{width}x{height} image cannot be split into {rows} rows and {columns} columns")]
    NotDivisible {
        width: u32,
        height: u32,
        rows: u32,
        columns: u32,
    },

    #[error("tile grid is incomplete: missing tile at row {row}, column {column}")]
    MissingTile { row: u32, column: u32 },

    #[error("tile at row {row}, column {column} is {found_width}x{found_height}, expected {width}x{height}")]
    TileSize {
        row: u32,
        column: u32,
        width: u32,
        height: u32,
        found_width: u32,
        found_height: u32,
    },
}

/// A resize request would leave a pool or the fleet outside its bounds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapacityError {
    #[error("cannot add a server: maximum of {max} servers reached")]
    MaxServers { max: usize },

    #[error("cannot remove a server: configured minimum is {min}")]
    MinServers { min: usize },

    #[error("cannot remove {requested} executor(s) from a pool of {size}: at least one must remain")]
    MinExecutors { requested: usize, size: usize },
}

/// The load registry file could not be read or written.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to {action} load registry {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RegistryError {
    pub(crate) fn io(action: &'static str, path: &std::path::Path, source: std::io::Error) -> Self {
        RegistryError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A compute server could not be brought up or torn down.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Capacity(#[from] CapacityError),
}

/// A dispatch job could not be created or finished.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Grid(#[from] GridError),

    #[error("failed to persist {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("merge task aborted: {0}")]
    Aborted(String),

    #[error("a job named {0} already exists")]
    DuplicateJob(String),
}
