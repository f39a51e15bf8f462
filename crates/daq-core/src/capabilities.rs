//! Atomic Hardware Capabilities
//!
//! Devices implement the small capability traits they actually support rather
//! than one monolithic `Camera` trait:
//!
//! - the readout camera of a streak system: `FrameProducer + ExposureControl + Triggerable`
//! - the streak unit: `ShutterControl`
//! - every component: `Parameterized`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn triggered_burst<C>(camera: &C, shots: usize) -> Result<()>
//! where
//!     C: FrameProducer + Triggerable,
//! {
//!     let mut images = camera.subscribe_images().await.context("no image stream")?;
//!     camera.arm().await?;
//!     camera.start_stream().await?;
//!     for _ in 0..shots {
//!         camera.trigger().await?;
//!         let image = images.recv().await?;
//!         println!("image #{}: {}x{}", image.sequence, image.width, image.height);
//!     }
//!     camera.stop_stream().await
//! }
//! ```

use crate::data::ImageRecord;
use crate::observable::ParameterSet;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

// =============================================================================
// Triggering
// =============================================================================

/// Capability: software-triggered acquisition
///
/// # Contract
/// - `arm()` switches the device to wait for triggers
/// - `trigger()` requests one acquisition
/// - `disarm()` returns the device to free-running operation
/// - Calling `trigger()` on an unarmed device should return Err
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Arm device for trigger
    async fn arm(&self) -> Result<()>;

    /// Send software trigger
    ///
    /// # Returns
    /// - Ok(()) if trigger accepted
    /// - Err if not armed
    async fn trigger(&self) -> Result<()>;

    /// Leave triggered mode
    ///
    /// # Default Implementation
    /// Returns an error indicating disarming is not supported.
    async fn disarm(&self) -> Result<()> {
        anyhow::bail!("Disarm not supported by this device")
    }

    /// Check if device is currently armed
    ///
    /// # Default Implementation
    /// Returns an error indicating state query is not supported.
    async fn is_armed(&self) -> Result<bool> {
        anyhow::bail!("Armed state query not supported by this device")
    }
}

// =============================================================================
// Exposure
// =============================================================================

/// Capability: Exposure Time Control
///
/// # Contract
/// - Exposure is in seconds (not milliseconds)
/// - Setting exposure does not start acquisition
#[async_trait]
pub trait ExposureControl: Send + Sync {
    /// Set exposure/integration time in seconds
    ///
    /// # Returns
    /// - Err if value is out of hardware range
    async fn set_exposure(&self, seconds: f64) -> Result<()>;

    /// Current exposure setting in seconds
    async fn get_exposure(&self) -> Result<f64>;
}

// =============================================================================
// Frame Production
// =============================================================================

/// Capability: image streaming
///
/// Images are delivered as `Arc<ImageRecord>` over a broadcast channel; each
/// subscriber receives every image published after it subscribed. Slow
/// subscribers observe `RecvError::Lagged` rather than blocking the producer.
#[async_trait]
pub trait FrameProducer: Send + Sync {
    /// Start continuous image acquisition
    ///
    /// Starting an already running stream is a no-op.
    async fn start_stream(&self) -> Result<()>;

    /// Start acquisition that stops by itself after `frame_limit` images
    ///
    /// `None` or `Some(0)` means continuous.
    ///
    /// # Default Implementation
    /// Warns and starts a continuous stream.
    async fn start_stream_finite(&self, frame_limit: Option<u32>) -> Result<()> {
        if let Some(n) = frame_limit.filter(|n| *n > 0) {
            tracing::warn!(
                "Device does not support finite acquisition; starting continuous stream \
                 (requested {} frames)",
                n
            );
        }
        self.start_stream().await
    }

    /// Stop image acquisition
    ///
    /// Stopping an idle device is a no-op.
    async fn stop_stream(&self) -> Result<()>;

    /// Current image resolution (width, height) in pixels
    fn resolution(&self) -> (u32, u32);

    /// Subscribe to the image stream
    ///
    /// # Returns
    /// - None if streaming is not supported by this device
    async fn subscribe_images(&self) -> Option<broadcast::Receiver<Arc<ImageRecord>>> {
        None
    }

    /// Number of active image subscribers
    fn receiver_count(&self) -> usize {
        0
    }

    /// Whether the device is currently acquiring
    ///
    /// # Default Implementation
    /// Returns an error indicating state query is not supported.
    async fn is_streaming(&self) -> Result<bool> {
        anyhow::bail!("Streaming state query not supported by this device")
    }

    /// Images delivered since the device was connected
    fn frame_count(&self) -> u64 {
        0
    }
}

// =============================================================================
// Shutter
// =============================================================================

/// Capability: Shutter Control
///
/// # Safety
/// Always verify shutter state before assuming the photocathode is protected.
#[async_trait]
pub trait ShutterControl: Send + Sync {
    /// Open the shutter
    async fn open_shutter(&self) -> Result<()>;

    /// Close the shutter
    async fn close_shutter(&self) -> Result<()>;

    /// Query shutter state
    ///
    /// # Returns
    /// - Ok(true) if open, Ok(false) if closed
    async fn is_shutter_open(&self) -> Result<bool>;
}

// =============================================================================
// Parameters
// =============================================================================

/// Devices that expose their parameters for introspection and control.
///
/// # Contract
/// - `parameters()` returns the device's parameter registry
/// - Hardware-backed state uses `Parameter<T>`
pub trait Parameterized: Send + Sync {
    /// Device parameter registry
    fn parameters(&self) -> &ParameterSet;
}

// =============================================================================
// Device Category
// =============================================================================

/// Device category for classification and grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceCategory {
    /// Cameras and imaging systems (FrameProducer)
    Camera,
    /// Detectors and sensors
    Detector,
    /// Delay and pulse generators
    TimingGenerator,
    /// Devices that don't fit other categories
    #[default]
    Other,
}

impl DeviceCategory {
    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Camera => "Cameras",
            Self::Detector => "Detectors",
            Self::TimingGenerator => "Timing Generators",
            Self::Other => "Other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Stub {
        streaming: AtomicBool,
    }

    #[async_trait]
    impl FrameProducer for Stub {
        async fn start_stream(&self) -> Result<()> {
            self.streaming.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_stream(&self) -> Result<()> {
            self.streaming.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn resolution(&self) -> (u32, u32) {
            (672, 512)
        }
    }

    #[tokio::test]
    async fn finite_default_falls_back_to_continuous() {
        let stub = Stub {
            streaming: AtomicBool::new(false),
        };
        stub.start_stream_finite(Some(3)).await.unwrap();
        assert!(stub.streaming.load(Ordering::SeqCst));
        assert!(stub.subscribe_images().await.is_none());
        assert!(stub.is_streaming().await.is_err());
        assert_eq!(stub.frame_count(), 0);
    }

    #[test]
    fn category_labels() {
        assert_eq!(DeviceCategory::default(), DeviceCategory::Other);
        assert_eq!(DeviceCategory::TimingGenerator.label(), "Timing Generators");
    }
}
