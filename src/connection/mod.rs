//! Duplex streaming connection
//!
//! One WebSocket carries both raw PCM audio (binary messages) and small
//! control messages (text) in each direction. A connection attempt either
//! opens or fails, never both; inbound traffic is translated into session
//! events tagged with the attempt id so events from a superseded
//! connection can be recognized and dropped.

mod client;
pub mod protocol;

pub use client::{establish, ConnectionHandle, Outbound};

/// Errors from establishing or using the streaming connection.
#[derive(Debug, Clone)]
pub enum ConnectionError {
    /// The WebSocket handshake did not complete in time.
    Timeout,
    /// The connection could not be established.
    Failed(String),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Timeout => write!(f, "Connection timed out"),
            ConnectionError::Failed(e) => write!(f, "Failed to connect: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}
