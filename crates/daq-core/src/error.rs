//! Custom error types for the workspace.
//!
//! This module defines the primary error type, `DaqError`, shared by every
//! crate in the workspace. Instrument-specific fault taxonomies (stage command
//! errors, positioner errors, laser interlocks, tuning failures) live next to
//! their drivers and wrap `DaqError` for everything below the protocol layer.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`** / **`MissingPort`**: Detected while building an
//!   instrument or loading settings. These are the only fatal conditions; an
//!   instrument without a port cannot be used at all.
//! - **`Io`** / **`SerialPortNotConnected`**: The serial channel itself failed.
//! - **`MalformedResponse`**: The instrument answered with something that could
//!   not be parsed, or did not answer inside the settle window (an empty line).
//!   Callers treat this as an unknown-state condition and keep the last good
//!   value.
//! - **`LockIn`** / **`Storage`**: Failures at the external collaborator
//!   boundaries (demodulator polling, calibration persistence).
//! - **`Timeout`** / **`Busy`** / **`Cancelled`**: Runtime conditions of
//!   long-running sweeps.
//!
//! By using `#[from]`, `DaqError` can be created from `std::io::Error` with the
//! `?` operator.

use thiserror::Error;

/// Convenience alias for results using the workspace error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the DAQ workspace.
///
/// # Example
///
/// ```rust
/// use daq_core::error::DaqError;
///
/// fn parse_position(command: &str, line: &str) -> Result<f64, DaqError> {
///     line.get(3..)
///         .and_then(|v| v.trim().parse().ok())
///         .ok_or_else(|| DaqError::malformed(command, line))
/// }
///
/// assert!(parse_position("1TP?", "1TP").is_err());
/// assert_eq!(parse_position("1TP?", "1TP2.5").unwrap(), 2.5);
/// ```
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration validation failed.
    ///
    /// Occurs when configuration values parse correctly but fail semantic
    /// validation (negative settle time, inverted wavelength range, ...).
    ///
    /// **Recovery Strategy**: Abort startup, display validation error message.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// No communication port was supplied for an instrument.
    ///
    /// Raised immediately at construction; the instrument cannot be used.
    #[error("No communication port given for {device}: enter a port such as 'COM1' or '/dev/ttyUSB0'")]
    MissingPort {
        /// Human-readable instrument name.
        device: String,
    },

    /// Standard I/O operation failed.
    ///
    /// **Source**: Wraps `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port has been closed.
    ///
    /// Occurs when a command is issued after the owning connection was closed
    /// at experiment teardown.
    #[error("Serial port not connected")]
    SerialPortNotConnected,

    /// The instrument response could not be parsed.
    ///
    /// An empty `response` means nothing arrived within the settle window.
    #[error("Malformed response to '{command}': {response:?}")]
    MalformedResponse {
        /// Command that was sent.
        command: String,
        /// Raw line that came back (possibly empty).
        response: String,
    },

    /// Instrument reported a condition that has no dedicated fault type.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// An operation did not complete within its deadline.
    #[error("{operation} timed out after {millis} ms")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// Deadline that expired.
        millis: u64,
    },

    /// Demodulator polling failed.
    #[error("Lock-in poll failed: {0}")]
    LockIn(String),

    /// Calibration storage could not be read or written.
    #[error("Calibration storage error: {0}")]
    Storage(String),

    /// A second sweep was requested while one is already in flight.
    #[error("{0} is busy: a sweep is already running")]
    Busy(String),

    /// The operation observed its cancellation token and stopped early.
    #[error("Operation cancelled")]
    Cancelled,
}

impl DaqError {
    /// Build a [`DaqError::MalformedResponse`] from a command and the raw line.
    pub fn malformed(command: impl Into<String>, response: impl Into<String>) -> Self {
        Self::MalformedResponse {
            command: command.into(),
            response: response.into(),
        }
    }

    /// Whether this error means the instrument can never be used as configured.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::MissingPort { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_port_is_fatal() {
        let err = DaqError::MissingPort {
            device: "Delay stage".into(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("Delay stage"));
    }

    #[test]
    fn malformed_response_is_not_fatal() {
        let err = DaqError::malformed("1TS", "");
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "Malformed response to '1TS': \"\"");
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> AppResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))?
        }
        assert!(matches!(fails(), Err(DaqError::Io(_))));
    }
}
