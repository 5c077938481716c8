//! Error types for the audio pump

use std::time::Duration;
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device and engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// The requested format or line is not supported by the platform
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The line exists but could not be opened
    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Device read failed: {0}")]
    ReadFailed(String),

    #[error("Device write failed: {0}")]
    WriteFailed(String),

    #[error("Cannot {operation} {engine} engine in state {state}")]
    InvalidState {
        engine: &'static str,
        operation: &'static str,
        state: &'static str,
    },

    #[error("Worker did not exit within {0:?}")]
    JoinTimeout(Duration),
}

/// Queue wait errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// A blocked wait was interrupted by shutdown
    #[error("Queue wait cancelled")]
    Cancelled,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
