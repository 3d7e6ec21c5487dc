//! Error types for rgahead.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for rgahead operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for rgahead operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The clear-to-send line never went high.
    #[error("Clear-to-send not asserted within {0:?}")]
    ClearToSendTimeout(Duration),

    /// The channel has been closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// A command did not complete in time.
    #[error("Command {command} timed out after {timeout:?}")]
    CommandTimeout {
        /// Wire text of the command.
        command: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// A response was rejected by the command's validator.
    #[error("Command {command} failed validation: {reason}")]
    ValidationFailure {
        /// Wire text of the command.
        command: String,
        /// Why the response was rejected.
        reason: String,
    },

    /// The scan watchdog fired before the scan completed.
    #[error("Scan timed out: received {received} of {expected} points")]
    ScanTimeout {
        /// Points the scan should have produced.
        expected: usize,
        /// Points actually assembled.
        received: usize,
    },

    /// The scan watchdog could not acquire the device lock.
    #[error("Device lock not acquired within {0:?}, suspected deadlock")]
    ScanDeadlock(Duration),

    /// Response text could not be parsed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid command definition.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failure classes surfaced through exception notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// No completion within the command timeout.
    CommandTimeout,
    /// Validator rejected the response or raised an error.
    ValidationFailure,
    /// Channel I/O failed.
    TransportFailure,
    /// Watchdog fired while scanning.
    ScanTimeout,
    /// Watchdog could not take the device lock.
    ScanDeadlock,
}

impl Error {
    /// Classify this error.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::CommandTimeout { .. } => FailureKind::CommandTimeout,
            Self::ValidationFailure { .. } | Self::Protocol(_) | Self::InvalidCommand(_) => {
                FailureKind::ValidationFailure
            },
            Self::ScanTimeout { .. } => FailureKind::ScanTimeout,
            Self::ScanDeadlock(_) => FailureKind::ScanDeadlock,
            _ => FailureKind::TransportFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_mapping() {
        let timeout = Error::CommandTimeout {
            command: "ID?".into(),
            timeout: Duration::from_millis(5),
        };
        assert_eq!(timeout.failure_kind(), FailureKind::CommandTimeout);
        assert_eq!(
            Error::Protocol("bad".into()).failure_kind(),
            FailureKind::ValidationFailure
        );
        assert_eq!(
            Error::ClearToSendTimeout(Duration::from_secs(1)).failure_kind(),
            FailureKind::TransportFailure
        );
        assert_eq!(
            Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone")).failure_kind(),
            FailureKind::TransportFailure
        );
        assert_eq!(
            Error::ScanDeadlock(Duration::from_secs(10)).failure_kind(),
            FailureKind::ScanDeadlock
        );
    }

    #[test]
    fn test_display_includes_command() {
        let err = Error::ValidationFailure {
            command: "IN0".into(),
            reason: "status 0x02".into(),
        };
        assert_eq!(err.to_string(), "Command IN0 failed validation: status 0x02");
    }
}
