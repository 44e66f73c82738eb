//! # Message Protocol
//!
//! Defines the two messages exchanged between dispatch workers and compute
//! servers:
//! - [`Request`]: a tile to transform, tagged with a correlation string
//! - [`Response`]: the transformed tile, echoing that correlation string
//!
//! Messages are serialized to JSON and sent over TCP with a 4-byte length prefix
//! (see [`Connection`](super::connection::Connection)). Image payloads are PNG
//! bytes carried as base64 strings so a tile does not balloon into a JSON array
//! of numbers.

use serde::{Deserialize, Serialize};

/// Status a server puts in a [`Response`] when the tile was transformed.
pub const STATUS_OK: &str = "OK";

/// Status a server puts in a [`Response`] when it could not handle the request.
pub const STATUS_ERROR: &str = "ERROR";

/// Request type used by dispatch workers.
pub const REQUEST_PROCESS: &str = "Ask to process";

// ============================================================================
// MESSAGE TYPES
// ============================================================================

/// **Tile Request**
///
/// Sent by a dispatch worker to a compute server.
///
/// # Fields
/// - `kind`: request type tag (serialized as `type`)
/// - `message`: free-text correlation string, echoed back in the response
/// - `image`: encoded (PNG) tile bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(with = "base64_bytes")]
    pub image: Vec<u8>,
}

/// **Tile Response**
///
/// Sent by a compute server after processing a [`Request`].
///
/// # Fields
/// - `status`: [`STATUS_OK`] or [`STATUS_ERROR`]
/// - `message`: the request's correlation string
/// - `image`: encoded (PNG) transformed tile bytes, empty on error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: String,
    pub message: String,
    #[serde(with = "base64_bytes")]
    pub image: Vec<u8>,
}

impl Request {
    pub fn process(message: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            kind: REQUEST_PROCESS.to_string(),
            message: message.into(),
            image,
        }
    }
}

impl Response {
    pub fn ok(message: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            message: message.into(),
            image,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Build the correlation string a dispatch worker attaches to its request.
///
/// # Example
/// ```ignore
/// assert_eq!(correlation_text("cat", 0, 1), "Image:cat SubImage(L:0 C:1)");
/// ```
pub fn correlation_text(job: &str, row: u32, column: u32) -> String {
    format!("Image:{} SubImage(L:{} C:{})", job, row, column)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
