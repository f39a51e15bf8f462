//! `daq-core`
//!
//! Core trait definitions and types shared by the streak-daq drivers and
//! the application binary.
//!
//! ## Modules
//!
//! - [`error`]: [`DaqError`](error::DaqError) and structured driver errors
//! - [`observable`]: watch-channel backed values and the [`ParameterSet`](observable::ParameterSet) registry
//! - [`parameter`]: [`Parameter<T>`](parameter::Parameter), observables wired to hardware
//! - [`data`]: frames and delivered image records
//! - [`capabilities`]: small async capability traits implemented by devices
//! - [`driver`]: driver factories and the capability bag they return

pub mod capabilities;
pub mod data;
pub mod driver;
pub mod error;
pub mod observable;
pub mod parameter;

// Re-export commonly used types
pub use anyhow::{anyhow, Result};
pub use data::{Frame, ImageRecord, Metadata};
pub use error::{DaqError, DriverError, DriverErrorKind};
pub use observable::{Observable, ParameterSet};
pub use parameter::Parameter;
