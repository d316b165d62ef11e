//! Error types for omlink.

use std::io;
use thiserror::Error;

/// Result type for omlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for omlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Link-level failure reported by the register transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No response within the caller-specified window.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or unexpected frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bad input to a frame or command builder.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Firmware file unreadable or trailer scan inconclusive.
    #[error("Invalid firmware: {0}")]
    InvalidFirmware(String),

    /// The bootloader reported an error in the control block status.
    #[error("Device reported error after {command}: status {status:#04x}")]
    Device {
        /// Bootloader command that was issued.
        command: &'static str,
        /// Raw status byte from the control block.
        status: u8,
    },

    /// A firmware block could not be verified after the bounded retries.
    #[error("Write failed at offset {offset:#08x} (status: {})", fmt_status(.status))]
    WriteFailed {
        /// Byte offset of the block start within the image.
        offset: u32,
        /// Last status byte observed, if any control block was read.
        status: Option<u8>,
    },

    /// The device rejected the CRC of the uploaded image.
    #[error("CRC check failed for image {image} (status: {})", fmt_status(.status))]
    CrcCheckFailed {
        /// Bank that was checked.
        image: u8,
        /// Status byte reported by the device, if any.
        status: Option<u8>,
    },

    /// Refused to overwrite the bank the device is currently executing.
    #[error("Image {image} is the currently running bank")]
    ActiveBank {
        /// Bank that was requested.
        image: u8,
    },

    /// The transport worker stopped before the request completed.
    #[error("Transport worker stopped")]
    WorkerStopped,

    /// The embedding application requested cancellation.
    #[error("Operation interrupted")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

fn fmt_status(status: &Option<u8>) -> String {
    status.map_or_else(|| "none".to_string(), |s| format!("{s:#04x}"))
}

impl Error {
    /// Whether this error means the request got no answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
