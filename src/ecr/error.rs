//! Failures surfaced at the controller boundary.

use std::time::Duration;
use thiserror::Error;

/// Why a terminal operation did not produce a result.
///
/// `Display` is the human-readable reason handed back to the cash register.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminalError {
    #[error("Terminal is already connected")]
    AlreadyConnected,

    #[error("Terminal is not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Failed to encode request: {0}")]
    Encode(String),

    #[error("Timeout awaiting terminal response to {operation} after {}ms", after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("Operation stopped: terminal is disconnecting")]
    Stopped,

    #[error("POS terminal is busy")]
    Busy,

    /// Terminal / protocol level condition (response code >= 1000).
    #[error("Terminal returned error code: {code} ({description})")]
    Rejected { code: String, description: String },

    /// Transaction-level decline (response code below 1000).
    #[error("Transaction failed with error code: {code} ({description})")]
    Declined { code: String, description: String },

    #[error("Terminal reported an error: {0}")]
    TerminalReported(String),

    #[error("Terminal does not implement the requested method")]
    MethodNotImplemented,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Invalid driver configuration: {0}")]
    Configuration(String),

    #[error("Device {0} not connected")]
    DeviceNotFound(String),
}

impl TerminalError {
    pub fn is_busy(&self) -> bool {
        matches!(self, TerminalError::Busy)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TerminalError::Timeout { .. })
    }

    /// Response code reported by the terminal, for rejections and declines.
    pub fn response_code(&self) -> Option<&str> {
        match self {
            TerminalError::Rejected { code, .. } | TerminalError::Declined { code, .. } => {
                Some(code)
            }
            _ => None,
        }
    }
}
