//! Error taxonomy for the RemoteEx client.

use daq_core::error::{DaqError, DriverError, DriverErrorKind};
use std::time::Duration;
use thiserror::Error;

use crate::protocol::describe_status;

/// Driver type string used in [`DriverError`]s raised by this crate.
pub const DRIVER_TYPE: &str = "hamamatsu_rx";

/// Result alias for RemoteEx operations.
pub type RxResult<T> = std::result::Result<T, RemoteExError>;

/// Failures of the RemoteEx client.
#[derive(Error, Debug)]
pub enum RemoteExError {
    /// A message did not have the `code,name,...` shape.
    #[error("Malformed RemoteEx message '{raw}': {reason}")]
    Protocol {
        /// Escaped message text.
        raw: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The device answered with a nonzero status code.
    #[error("RemoteEx error {code}: {}", describe_status(*.code))]
    Device {
        /// Status code reported by RemoteEx.
        code: i32,
        /// Function name echoed in the reply.
        function: String,
        /// Remaining reply fields.
        args: Vec<String>,
    },

    /// No reply with the expected function name arrived in time.
    #[error("No answer to {command} within {waited:?} (last response: {})", .last_response.as_deref().unwrap_or("none"))]
    Timeout {
        /// Function name of the command.
        command: String,
        /// Time spent waiting.
        waited: Duration,
        /// Last unrelated reply seen while waiting.
        last_response: Option<String>,
    },

    /// The command channel could not be (re)established.
    #[error("Could not connect to RemoteEx: {0}")]
    Connection(String),

    /// Image or scaling-table bytes were incomplete.
    #[error("Frame transfer failed: {0}")]
    Frame(String),

    /// The acquisition PC is reachable but not usable without operator action.
    #[error("RemoteEx not ready: {0}")]
    NotReady(String),

    /// A calibration table was rejected.
    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),

    /// A value cannot be represented on the wire or was not understood.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The client has been shut down.
    #[error("RemoteEx client is closed")]
    Closed,

    /// Socket level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteExError {
    /// Driver error category for this failure.
    pub fn kind(&self) -> DriverErrorKind {
        match self {
            Self::Protocol { .. } => DriverErrorKind::Protocol,
            Self::Device { .. } | Self::Frame(_) => DriverErrorKind::Hardware,
            Self::Timeout { .. } => DriverErrorKind::Timeout,
            Self::Connection(_) | Self::Io(_) => DriverErrorKind::Communication,
            Self::NotReady(_) => DriverErrorKind::Initialization,
            Self::InvalidCalibration(_) | Self::InvalidValue(_) => DriverErrorKind::InvalidParameter,
            Self::Closed => DriverErrorKind::Shutdown,
        }
    }

    /// Status code, for device errors.
    pub fn status_code(&self) -> Option<i32> {
        match self {
            Self::Device { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<RemoteExError> for DaqError {
    fn from(err: RemoteExError) -> Self {
        DaqError::Driver(DriverError::new(DRIVER_TYPE, err.kind(), err.to_string()))
    }
}
