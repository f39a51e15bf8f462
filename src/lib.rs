//! # Streak DAQ
//!
//! Headless front-end for Hamamatsu streak cameras controlled through the
//! RemoteEx server of the HPD-TA software.
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-based loading of `config/streak_daq.toml` with
//!   `STREAK_DAQ_` environment overrides.
//! - **`logging`**: `tracing-subscriber` initialisation from the configuration.
//! - **`session`**: the one-shot `info` and `acquire` sessions of the binary.
//!
//! The RemoteEx client itself lives in `daq-driver-hamamatsu`; the shared
//! parameter and capability abstractions in `daq-core`.

pub mod config;
pub mod logging;
pub mod session;

pub use config::StreakDaqConfig;
