//! Error types shared by the acquisition stack.
//!
//! `DaqError` is the single error type that crosses crate boundaries. Driver
//! crates keep their own, richer error enums internally and convert into
//! [`DaqError::Driver`] at the capability-trait boundary so that callers can
//! match on a [`DriverErrorKind`] without knowing which instrument failed.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: semantically invalid settings caught during validation.
//! - **`Io`**: wraps `std::io::Error` from file and socket operations.
//! - **`Instrument`**: free-form instrument failure without further structure.
//! - **`Driver`**: structured failure tagged with the driver type and a kind.
//! - **`FrameSizeMismatch`**: a pixel payload that does not match its declared shape.
//! - **`ShutdownFailed`**: aggregated errors from a tear-down that kept going.
//! - **`Parameter*`**: misuse of a [`crate::parameter::Parameter`].

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Broad category of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Device bring-up failed (connect, greeting, licence, identity).
    Initialization,
    /// Driver configuration was rejected.
    Configuration,
    /// Transport-level failure (socket closed, send failed, reconnect failed).
    Communication,
    /// Peer sent something that could not be decoded.
    Protocol,
    /// Tear-down did not complete cleanly.
    Shutdown,
    /// Device reported a failure status for a command.
    Hardware,
    /// No matching reply arrived in time.
    Timeout,
    /// A parameter value was outside what the device accepts.
    InvalidParameter,
    /// Anything that does not fit the categories above.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Protocol => "protocol",
            DriverErrorKind::Shutdown => "shutdown",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Structured driver failure.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver type string as registered with the factory (e.g. `"hamamatsu_rx"`).
    pub driver_type: String,
    /// Failure category.
    pub kind: DriverErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl DriverError {
    /// Build a driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Primary error type for the acquisition stack.
///
/// # Error Categories
///
/// 1. **Configuration Errors** - `Configuration`
///    - Raised while loading or validating settings, before any socket is opened.
///    - Recovery: fix the configuration and restart.
///
/// 2. **Hardware/Communication Errors** - `Instrument`, `Driver`, `Io`
///    - Raised while talking to the acquisition PC.
///    - `Driver` carries a [`DriverErrorKind`]; `Timeout` and `Communication`
///      are usually transient, `Hardware` and `Protocol` usually are not.
///
/// 3. **Runtime Errors** - `FrameSizeMismatch`, `Parameter*`, `ShutdownFailed`
///    - Raised by data handling or by misuse of the parameter API.
///
/// # Example
///
/// ```rust,ignore
/// use daq_core::error::{DaqError, DriverError, DriverErrorKind};
///
/// fn reject_gain(gain: i64) -> Result<(), DaqError> {
///     if gain > 63 {
///         return Err(DaqError::Driver(DriverError::new(
///             "hamamatsu_rx",
///             DriverErrorKind::InvalidParameter,
///             format!("MCP gain {gain} above 63"),
///         )));
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration validation failed.
    ///
    /// Occurs when values parse correctly but make no sense together, e.g. an
    /// empty host name or a zero command timeout.
    ///
    /// **Error Type**: Permanent - requires fixing the configuration values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    ///
    /// **Error Type**: Can be transient (`TimedOut`, `ConnectionReset`) or
    /// permanent (`PermissionDenied`, `NotFound`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Instrument hardware error without further structure.
    ///
    /// Prefer [`DaqError::Driver`] when the failure can be categorised.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Structured driver error with category
    #[error("{0}")]
    Driver(DriverError),

    /// A pixel payload did not match the declared frame dimensions.
    ///
    /// **Error Type**: Per-frame. The acquisition loop logs it and moves on to
    /// the next frame.
    #[error("Frame {width}x{height} expects {expected} bytes, got {actual}")]
    FrameSizeMismatch {
        /// Declared width in pixels.
        width: u32,
        /// Declared height in pixels.
        height: u32,
        /// Bytes implied by the dimensions.
        expected: usize,
        /// Bytes actually supplied.
        actual: usize,
    },

    /// Tear-down encountered errors but ran to completion.
    ///
    /// Every sub-step of a shutdown is attempted even when an earlier one
    /// failed; the individual failures are collected here.
    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<DaqError>),

    /// Attempted to modify a read-only parameter.
    #[error("Parameter is read-only")]
    ParameterReadOnly,

    /// Value is not one of the parameter's allowed choices.
    #[error("Invalid choice for parameter")]
    ParameterInvalidChoice,

    /// No hardware reader connected for parameter.
    ///
    /// Indicates a mirror that was never wired to its device query.
    #[error("No hardware reader connected")]
    ParameterNoHardwareReader,
}

impl DaqError {
    /// Driver error kind, if this is a structured driver error.
    pub fn driver_kind(&self) -> Option<DriverErrorKind> {
        match self {
            DaqError::Driver(err) => Some(err.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Instrument("streak unit not responding".to_string());
        assert_eq!(err.to_string(), "Instrument error: streak unit not responding");
    }

    #[test]
    fn test_shutdown_failed_counts_errors() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Instrument("AppEnd timed out".into()),
            DaqError::Instrument("shutter stuck".into()),
        ]);
        assert_eq!(err.to_string(), "Shutdown failed with 2 error(s)");
    }

    #[test]
    fn test_driver_error_display_and_kind() {
        let err = DaqError::Driver(DriverError::new(
            "hamamatsu_rx",
            DriverErrorKind::Timeout,
            "no reply to AppInfo",
        ));
        assert!(err
            .to_string()
            .contains("Driver 'hamamatsu_rx' timeout error"));
        assert_eq!(err.driver_kind(), Some(DriverErrorKind::Timeout));
        assert_eq!(DaqError::ParameterReadOnly.driver_kind(), None);
    }

    #[test]
    fn test_frame_size_mismatch_display() {
        let err = DaqError::FrameSizeMismatch {
            width: 4,
            height: 2,
            expected: 16,
            actual: 15,
        };
        assert_eq!(err.to_string(), "Frame 4x2 expects 16 bytes, got 15");
    }
}
