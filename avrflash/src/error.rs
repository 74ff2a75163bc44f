//! Error types for avrflash.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::stk500::Command;

/// Result type for avrflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for avrflash operations.
///
/// Every error is fatal to the flash session it occurs in. Only the sync
/// handshake retries internally; nothing else is attempted twice.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The transport reported end-of-stream or yielded an empty read.
    #[error("Stream closed")]
    StreamClosed,

    /// No acknowledgment arrived within the budget.
    #[error("Timeout: no acknowledgment within {} ms", .0.as_millis())]
    Timeout(Duration),

    /// Another acknowledgment read is already outstanding on the same buffer.
    #[error("Acknowledgment read already in progress")]
    ReadInProgress,

    /// The bootloader answered with something other than the expected
    /// response content.
    ///
    /// Reserved: the acknowledgment scanner discards non-matching bytes
    /// instead of reporting them, so today these surface as [`Error::Timeout`].
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// All sync attempts went unanswered.
    #[error("No bootloader response after {attempts} sync attempts")]
    SyncFailed {
        /// Number of attempts made.
        attempts: u32,
    },

    /// A single STK500v1 command was not acknowledged.
    #[error("{command} failed: {source}")]
    Command {
        /// The command that failed.
        command: Command,
        /// Underlying cause (timeout, closed stream, transport error).
        #[source]
        source: Box<Error>,
    },

    /// A HEX record targets the protected bootloader region.
    #[error(
        "HEX record on line {line} writes to 0x{address:04X}, inside the bootloader region (starts at 0x{boundary:04X})"
    )]
    BootloaderRegion {
        /// 1-based line number of the offending record.
        line: usize,
        /// First byte address of the record that falls in the region.
        address: u32,
        /// Configured bootloader start address.
        boundary: u32,
    },

    /// Malformed HEX record.
    #[error("Invalid HEX record on line {line}: {reason}")]
    ImageParse {
        /// 1-based line number of the offending record.
        line: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// Protocol usage error detected before anything was sent.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device not found.
    #[error("Device not found")]
    DeviceNotFound,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wrap `self` as the cause of a failed `command`.
    pub(crate) fn in_command(self, command: Command) -> Self {
        Self::Command {
            command,
            source: Box::new(self),
        }
    }

    /// Whether this error (or its command cause) is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Command { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Whether the device never answered the bootloader handshake.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::SyncFailed { .. } | Self::DeviceNotFound)
    }
}
