//! `DriverFactory` for the RemoteEx streak camera.
//!
//! # Configuration
//!
//! ```toml
//! host = "192.168.0.10"
//! port = 1001                 # data port is port + 1
//! settings_ini = "C:\\ProgramData\\Hamamatsu\\HPDTA\\streak.ini"
//!
//! [streak_unit.time_ranges]   # synchroscan units only: range id -> seconds
//! 1 = 1.2e-10
//!
//! [delay_generator]
//! enabled = true
//! time_range_to_delay = { "1e-06" = 2e-08, "0.001" = 5e-08 }
//!
//! [readout_camera]
//! ring_buffers = 3
//! ```

use anyhow::{anyhow, Context, Result};
use daq_core::capabilities::DeviceCategory;
use daq_core::driver::{Capability, DeviceComponents, DeviceMetadata, DriverFactory};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::acquisition::DEFAULT_RING_BUFFERS;
use crate::delay_generator::MAX_DELAY;
use crate::error::DRIVER_TYPE;
use crate::invoker::DEFAULT_COMMAND_TIMEOUT;
use crate::streak_camera::StreakCamera;
use crate::streak_unit::TimeRangeTable;

fn default_command_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT.as_millis() as u64
}

fn default_app_start_timeout_ms() -> u64 {
    crate::commands::APP_START_TIMEOUT.as_millis() as u64
}

fn default_true() -> bool {
    true
}

fn default_ring_buffers() -> u32 {
    DEFAULT_RING_BUFFERS
}

/// Streak unit options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreakUnitConfig {
    /// Time range ids of synchroscan units (as text, TOML keys are strings),
    /// mapped to seconds.
    #[serde(default)]
    pub time_ranges: BTreeMap<String, f64>,
}

impl StreakUnitConfig {
    /// Time range table keyed by numeric id.
    pub fn time_range_table(&self) -> Result<TimeRangeTable> {
        self.time_ranges
            .iter()
            .map(|(id, seconds)| {
                let id = id
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| anyhow!("time range id '{}' is not an integer", id))?;
                Ok((id, *seconds))
            })
            .collect()
    }
}

/// Delay generator options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DelayGeneratorConfig {
    /// Whether the system has a delay generator. Off unless set.
    #[serde(default)]
    pub enabled: bool,
    /// Time range (s, as text) -> trigger delay (s).
    #[serde(default)]
    pub time_range_to_delay: Option<BTreeMap<String, f64>>,
}

impl Default for DelayGeneratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            time_range_to_delay: None,
        }
    }
}

/// Readout camera options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadoutCameraConfig {
    /// Whether to bring up the readout camera.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Size of the RemoteEx image ring buffer.
    #[serde(default = "default_ring_buffers")]
    pub ring_buffers: u32,
}

impl Default for ReadoutCameraConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ring_buffers: DEFAULT_RING_BUFFERS,
        }
    }
}

/// Configuration of a RemoteEx streak camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HamamatsuRxConfig {
    /// Host name or IP address of the acquisition PC.
    pub host: String,
    /// Command port; images are served on `port + 1`.
    pub port: u16,
    /// HPD-TA settings file selecting the hardware to initialise.
    #[serde(default)]
    pub settings_ini: Option<String>,
    /// Reply budget for ordinary commands (ms).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Reply budget for `AppStart` (ms).
    #[serde(default = "default_app_start_timeout_ms")]
    pub app_start_timeout_ms: u64,
    /// Streak unit options.
    #[serde(default)]
    pub streak_unit: StreakUnitConfig,
    /// Delay generator options.
    #[serde(default)]
    pub delay_generator: DelayGeneratorConfig,
    /// Readout camera options.
    #[serde(default)]
    pub readout_camera: ReadoutCameraConfig,
}

impl HamamatsuRxConfig {
    /// Minimal configuration for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            settings_ini: None,
            command_timeout_ms: default_command_timeout_ms(),
            app_start_timeout_ms: default_app_start_timeout_ms(),
            streak_unit: StreakUnitConfig::default(),
            delay_generator: DelayGeneratorConfig::default(),
            readout_camera: ReadoutCameraConfig::default(),
        }
    }

    /// Reply budget for ordinary commands.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Reply budget for `AppStart`.
    pub fn app_start_timeout(&self) -> Duration {
        Duration::from_millis(self.app_start_timeout_ms)
    }

    /// Check values that deserialisation alone accepts.
    pub fn check(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("host must not be empty"));
        }
        if self.port == u16::MAX {
            return Err(anyhow!("port {} leaves no room for the data port", self.port));
        }
        if self.command_timeout_ms == 0 || self.app_start_timeout_ms == 0 {
            return Err(anyhow!("timeouts must be positive"));
        }
        self.streak_unit.time_range_table()?;
        if self.readout_camera.ring_buffers == 0 {
            return Err(anyhow!("readout_camera.ring_buffers must be at least 1"));
        }
        if let Some(table) = &self.delay_generator.time_range_to_delay {
            for (time_range, delay) in table {
                time_range.trim().parse::<f64>().map_err(|_| {
                    anyhow!("time_range_to_delay key '{}' is not a time in seconds", time_range)
                })?;
                if !(0.0..=MAX_DELAY).contains(delay) {
                    return Err(anyhow!(
                        "Trigger delay {} for time range {} is outside 0..{} s",
                        delay,
                        time_range,
                        MAX_DELAY
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Factory for RemoteEx streak cameras.
pub struct HamamatsuRxFactory;

static CAPABILITIES: &[Capability] = &[
    Capability::FrameProducer,
    Capability::ExposureControl,
    Capability::Triggerable,
    Capability::ShutterControl,
    Capability::Parameterized,
];

impl DriverFactory for HamamatsuRxFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER_TYPE
    }

    fn name(&self) -> &'static str {
        "Hamamatsu streak camera (RemoteEx)"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: HamamatsuRxConfig = config.clone().try_into()?;
        cfg.check()
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: HamamatsuRxConfig = config
                .try_into()
                .context("Invalid Hamamatsu RemoteEx config")?;
            cfg.check()?;

            let system = StreakCamera::connect(&cfg).await?;
            let mut metadata = DeviceMetadata {
                category: Some(DeviceCategory::Camera),
                software_version: Some(system.software_version().to_string()),
                ..DeviceMetadata::default()
            };

            let mut components = DeviceComponents::new()
                .with_category(DeviceCategory::Camera)
                .with_parameterized(Arc::new(system.clone()))
                .with_lifecycle(Arc::new(system.clone()));
            if system.streak_unit().has_shutter() {
                components = components.with_shutter_control(system.streak_unit().clone());
            }
            if let Some(camera) = system.readout_camera() {
                let (width, height) = camera.resolution_parameter().get();
                metadata.frame_width = Some(width);
                metadata.frame_height = Some(height);
                metadata.bits_per_pixel = Some(16);
                if let Some((min, max)) = camera.exposure_time().range() {
                    metadata.min_exposure_ms = Some(min * 1e3);
                    metadata.max_exposure_ms = Some(max * 1e3);
                }
                components = components
                    .with_frame_producer(camera.clone())
                    .with_exposure_control(camera.clone())
                    .with_triggerable(camera.clone());
            }
            Ok(components.with_metadata(metadata))
        })
    }
}
