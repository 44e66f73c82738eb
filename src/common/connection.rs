//! # TCP Connection Abstraction
//!
//! Provides a wrapper around TCP streams with message framing for the tile protocol.
//!
//! ## Wire Protocol
//!
//! Messages are sent with a 4-byte length prefix (big-endian) followed by JSON data:
//! ```text
//! [4 bytes: message length] [N bytes: JSON message data]
//! ```
//!
//! A connection may carry any number of frames in each direction; the peer
//! ends the conversation by closing its side of the stream.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::error::ProtocolError;

/// Maximum allowed frame size (100MB) to prevent memory exhaustion.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// TCP connection wrapper with message framing support.
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Create a new Connection from an existing TCP stream.
    ///
    /// # Example
    /// ```ignore
    /// let stream = TcpStream::connect("127.0.0.1:5001").await?;
    /// let mut conn = Connection::new(stream);
    /// ```
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Read one message from the connection.
    ///
    /// # Returns
    /// - `Ok(Some(T))`: a complete frame was read and decoded
    /// - `Ok(None)`: the peer closed the stream between frames
    /// - `Err(ProtocolError)`: I/O failure, oversized frame or undecodable JSON
    ///
    /// # Protocol
    /// 1. Reads 4-byte length prefix (big-endian u32)
    /// 2. Rejects frames above [`MAX_MESSAGE_SIZE`]
    /// 3. Reads the frame body
    /// 4. Deserializes JSON into `T`
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        let mut length_buf = [0u8; 4];

        match self.stream.read_exact(&mut length_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let length = u32::from_be_bytes(length_buf) as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut data = vec![0u8; length];
        self.stream.read_exact(&mut data).await?;

        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Write one message to the connection.
    ///
    /// # Protocol
    /// 1. Serializes message to JSON
    /// 2. Writes 4-byte length prefix (big-endian u32)
    /// 3. Writes message data
    /// 4. Flushes stream to ensure delivery
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<(), ProtocolError> {
        let data = serde_json::to_vec(message)?;
        let length = data.len() as u32;

        self.stream.write_all(&length.to_be_bytes()).await?;
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;

        Ok(())
    }

    /// Close the write half so the peer sees end-of-stream.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
