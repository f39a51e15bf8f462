//! Driver Factory and Component Types
//!
//! Drivers implement [`DriverFactory`]. The composition root picks a factory
//! by its `driver_type`, validates the TOML section for the device, then
//! awaits `build()` to obtain a [`DeviceComponents`] capability bag.
//!
//! ```text
//! config/streak_daq.toml  ──▶  factory.validate(&section)
//!                                    │
//!                                    ▼
//!                             factory.build(section).await
//!                                    │
//!                                    ▼
//!                             DeviceComponents { frame_producer, shutter_control, ... }
//! ```
//!
//! # Example: Implementing a Driver Factory
//!
//! ```rust,ignore
//! pub struct MyCameraFactory;
//!
//! impl DriverFactory for MyCameraFactory {
//!     fn driver_type(&self) -> &'static str { "my_camera" }
//!     fn name(&self) -> &'static str { "My Camera" }
//!
//!     fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
//!         let _: MyCameraConfig = config.clone().try_into()?;
//!         Ok(())
//!     }
//!
//!     fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
//!         Box::pin(async move {
//!             let cfg: MyCameraConfig = config.try_into()?;
//!             let camera = Arc::new(MyCamera::connect(cfg).await?);
//!             Ok(DeviceComponents::new()
//!                 .with_frame_producer(camera.clone())
//!                 .with_parameterized(camera))
//!         })
//!     }
//! }
//! ```

use crate::capabilities::{
    DeviceCategory, ExposureControl, FrameProducer, Parameterized, ShutterControl, Triggerable,
};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags mirroring the capability traits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Can be armed and software-triggered.
    /// Corresponds to [`crate::capabilities::Triggerable`]
    Triggerable,

    /// Produces images.
    /// Corresponds to [`crate::capabilities::FrameProducer`]
    FrameProducer,

    /// Has exposure time control.
    /// Corresponds to [`crate::capabilities::ExposureControl`]
    ExposureControl,

    /// Has a shutter.
    /// Corresponds to [`crate::capabilities::ShutterControl`]
    ShutterControl,

    /// Exposes observable parameters.
    /// Corresponds to [`crate::capabilities::Parameterized`]
    Parameterized,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Triggerable => "Triggerable",
            Self::FrameProducer => "Frame Producer",
            Self::ExposureControl => "Exposure Control",
            Self::ShutterControl => "Shutter Control",
            Self::Parameterized => "Parameterized",
        }
    }
}

// =============================================================================
// Lifecycle Hooks
// =============================================================================

/// Hooks run when a device is registered with, and removed from, the application.
///
/// `on_unregister` is where a driver returns hardware to a safe state and
/// releases its connections.
pub trait DeviceLifecycle: Send + Sync {
    /// Called after the device has been built.
    fn on_register(&self) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Called before the device is dropped.
    fn on_unregister(&self) -> BoxFuture<'static, Result<()>>;
}

// =============================================================================
// Device Components (Capability Bag)
// =============================================================================

/// Capability trait objects returned by a driver factory.
///
/// Each capability is stored separately so that one driver can hand out
/// different objects for different capabilities (a streak system serves
/// frames from its readout camera and shutter control from its streak unit).
#[derive(Default)]
pub struct DeviceComponents {
    /// Device category
    pub category: Option<DeviceCategory>,

    /// Triggerable implementation (arm/trigger/disarm)
    pub triggerable: Option<Arc<dyn Triggerable>>,

    /// FrameProducer implementation (image streaming)
    pub frame_producer: Option<Arc<dyn FrameProducer>>,

    /// ExposureControl implementation (exposure time)
    pub exposure_control: Option<Arc<dyn ExposureControl>>,

    /// ShutterControl implementation
    pub shutter_control: Option<Arc<dyn ShutterControl>>,

    /// Parameterized implementation (parameter registry)
    pub parameterized: Option<Arc<dyn Parameterized>>,

    /// Registration/shutdown hooks
    pub lifecycle: Option<Arc<dyn DeviceLifecycle>>,

    /// Capability-specific metadata
    pub metadata: DeviceMetadata,
}

impl DeviceComponents {
    /// Create a new empty DeviceComponents
    pub fn new() -> Self {
        Self::default()
    }

    /// Capabilities present in this bag
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();

        if self.triggerable.is_some() {
            caps.push(Capability::Triggerable);
        }
        if self.frame_producer.is_some() {
            caps.push(Capability::FrameProducer);
        }
        if self.exposure_control.is_some() {
            caps.push(Capability::ExposureControl);
        }
        if self.shutter_control.is_some() {
            caps.push(Capability::ShutterControl);
        }
        if self.parameterized.is_some() {
            caps.push(Capability::Parameterized);
        }

        caps
    }

    /// Set device category
    pub fn with_category(mut self, category: DeviceCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Set Triggerable implementation
    pub fn with_triggerable(mut self, t: Arc<dyn Triggerable>) -> Self {
        self.triggerable = Some(t);
        self
    }

    /// Set FrameProducer implementation
    pub fn with_frame_producer(mut self, f: Arc<dyn FrameProducer>) -> Self {
        self.frame_producer = Some(f);
        self
    }

    /// Set ExposureControl implementation
    pub fn with_exposure_control(mut self, e: Arc<dyn ExposureControl>) -> Self {
        self.exposure_control = Some(e);
        self
    }

    /// Set ShutterControl implementation
    pub fn with_shutter_control(mut self, s: Arc<dyn ShutterControl>) -> Self {
        self.shutter_control = Some(s);
        self
    }

    /// Set Parameterized implementation
    pub fn with_parameterized(mut self, p: Arc<dyn Parameterized>) -> Self {
        self.parameterized = Some(p);
        self
    }

    /// Set lifecycle hooks
    pub fn with_lifecycle(mut self, l: Arc<dyn DeviceLifecycle>) -> Self {
        self.lifecycle = Some(l);
        self
    }

    /// Set device metadata
    pub fn with_metadata(mut self, metadata: DeviceMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

// =============================================================================
// Device Metadata
// =============================================================================

/// Capability-specific metadata for a device.
#[derive(Debug, Clone, Default)]
pub struct DeviceMetadata {
    /// Device category
    pub category: Option<DeviceCategory>,

    /// Hardware identification as reported by the device
    pub hardware_name: Option<String>,

    /// Firmware/software version string
    pub software_version: Option<String>,

    /// For FrameProducer devices: frame width in pixels
    pub frame_width: Option<u32>,

    /// For FrameProducer devices: frame height in pixels
    pub frame_height: Option<u32>,

    /// For FrameProducer devices: bits per pixel
    pub bits_per_pixel: Option<u32>,

    /// For ExposureControl devices: minimum exposure in milliseconds
    pub min_exposure_ms: Option<f64>,

    /// For ExposureControl devices: maximum exposure in milliseconds
    pub max_exposure_ms: Option<f64>,
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Factory that validates a device configuration and builds the device.
///
/// Factories are stateless and live for the program's lifetime. `build()`
/// returns a `'static` future so it can be spawned.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name matched against the `type` field of a device section.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// Capabilities this driver type provides.
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Validate configuration without touching hardware.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Connect to the hardware and return its capabilities.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>>;
}
