//! Error types shared by the codec, the transfer engine and the session.
use std::time::Duration;

use thiserror::Error;

use crate::protocol::PacketType;

#[derive(Debug, Error)]
pub enum Error {
    /// Header, length, checksum or type byte of a received frame is inconsistent.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Payload does not fit into one frame.
    #[error("Packet too large: {len} bytes exceeds maximum of {max}")]
    PacketTooLarge { len: usize, max: usize },

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// The reply type does not match what the session waits for.
    #[error("Expected {expected} packet, got {got} packet")]
    WrongPacket { expected: PacketType, got: PacketType },

    /// Failure reported by, or detected on, the target device.
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Post-write verification mismatch.
    #[error("Hardware error: {0}")]
    HardwareError(String),

    #[error("Invalid instruction pattern: {0}")]
    InvalidPattern(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Connection failed: {0}")]
    ConnectionError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Chip database error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<scroll::Error> for Error {
    fn from(e: scroll::Error) -> Self {
        Error::MalformedPacket(e.to_string())
    }
}

/// Coarse grouping used to pick the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Argument,
    Network,
    Device,
}

impl ErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::Argument => 1,
            ErrorCategory::Network => 2,
            ErrorCategory::Device => 3,
        }
    }
}

impl Error {
    /// Only a missing reply may be retried; everything else desynchronizes the session.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidArgument(_) => ErrorCategory::Argument,
            Error::MalformedPacket(_)
            | Error::PacketTooLarge { .. }
            | Error::Timeout(_)
            | Error::ConnectionError(_)
            | Error::Io(_)
            | Error::Serial(_) => ErrorCategory::Network,
            Error::WrongPacket { .. }
            | Error::DeviceError(_)
            | Error::HardwareError(_)
            | Error::InvalidPattern(_)
            | Error::InternalError(_)
            | Error::Yaml(_) => ErrorCategory::Device,
        }
    }
}
