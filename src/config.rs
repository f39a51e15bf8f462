//! Application configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/streak_daq.toml` (base configuration)
//! 2. Environment variables prefixed with `STREAK_DAQ_`, nested keys
//!    separated by `__` (e.g. `STREAK_DAQ_CAMERA__HOST=streak-pc`)
//!
//! # Example
//! ```no_run
//! use streak_daq::config::StreakDaqConfig;
//!
//! let config = StreakDaqConfig::load()?;
//! println!("Camera: {}:{}", config.camera.host, config.camera.port);
//! # Ok::<(), figment::Error>(())
//! ```

use daq_driver_hamamatsu::HamamatsuRxConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/streak_daq.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "STREAK_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreakDaqConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// RemoteEx server and component options
    pub camera: HamamatsuRxConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format selectable from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// Single line per event
    Compact,
    /// One JSON object per event
    Json,
}

fn default_name() -> String {
    "streak-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl StreakDaqConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error as long as the environment supplies
    /// the required camera keys.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.camera.port == 0 {
            return Err("Invalid camera port 0".to_string());
        }

        self.camera
            .check()
            .map_err(|e| format!("Invalid camera configuration: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(
            r#"
[application]
name = "Lab 3"
log_level = "debug"
log_format = "json"

[camera]
host = "streak-pc"
port = 1001

[camera.delay_generator]
enabled = true
time_range_to_delay = { "1e-06" = 2e-08 }

[camera.readout_camera]
ring_buffers = 5
"#,
        );

        let config = StreakDaqConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "Lab 3");
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert_eq!(config.camera.host, "streak-pc");
        assert_eq!(config.camera.port, 1001);
        assert_eq!(config.camera.command_timeout_ms, 5000);
        assert_eq!(config.camera.readout_camera.ring_buffers, 5);
        assert!(config.camera.delay_generator.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_application_defaults() {
        let file = write_config("[camera]\nhost = \"localhost\"\nport = 1001\n");

        let config = StreakDaqConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "streak-daq");
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.application.log_format, LogFormat::Pretty);
        assert!(config.camera.settings_ini.is_none());
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let file = write_config(
            "[application]\nlog_level = \"info\"\n[camera]\nhost = \"localhost\"\nport = 1001\n",
        );

        figment::Jail::expect_with(|jail| {
            jail.set_env("STREAK_DAQ_APPLICATION__LOG_LEVEL", "warn");
            jail.set_env("STREAK_DAQ_CAMERA__HOST", "10.0.0.7");
            let config = StreakDaqConfig::load_from(file.path())?;
            assert_eq!(config.application.log_level, "warn");
            assert_eq!(config.camera.host, "10.0.0.7");
            assert_eq!(config.camera.port, 1001);
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_missing_camera_is_an_error() {
        let file = write_config("[application]\nname = \"x\"\n");
        assert!(StreakDaqConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = StreakDaqConfig {
            application: ApplicationConfig::default(),
            camera: HamamatsuRxConfig::new("localhost", 1001),
        };
        assert!(config.validate().is_ok());

        config.application.log_level = "loud".to_string();
        assert!(config.validate().unwrap_err().contains("log_level"));

        config.application.log_level = "DEBUG".to_string();
        config.camera.port = 0;
        assert!(config.validate().is_err());

        config.camera.port = 1001;
        config.camera.host = " ".to_string();
        assert!(config.validate().unwrap_err().contains("host"));
    }
}
