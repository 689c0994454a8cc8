//! Control connection error types

use thiserror::Error;

use super::protocol::ChannelKind;

/// Failures on an established control connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Connection closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Server error: {0}")]
    Server(String),
}

/// The control session could not be brought up
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Failed to connect to {url}: {message}")]
    Unreachable { url: String, message: String },

    #[error("Initial port query failed: {0}")]
    Query(#[from] ControlError),

    #[error("Unexpected initial {channel} port: expected {expected}, got {actual}")]
    UnexpectedPort {
        channel: ChannelKind,
        expected: u16,
        actual: u16,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("Control task failed: {0}")]
    Task(String),
}
