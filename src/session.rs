//! One-shot sessions run by the `streak-daq` binary.

use anyhow::{anyhow, Context, Result};
use daq_core::capabilities::{FrameProducer, Parameterized, Triggerable};
use daq_core::ImageRecord;
use daq_driver_hamamatsu::{metadata, StreakCamera};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, instrument, warn};

/// Per-frame summary printed by `acquire`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSummary {
    /// RemoteEx ring-buffer sequence number.
    pub sequence: u64,
    /// Columns.
    pub width: u32,
    /// Rows.
    pub height: u32,
    /// Mean pixel value.
    pub mean: f64,
    /// Start of the exposure, seconds since the Unix epoch.
    pub acquisition_date: Option<f64>,
}

impl FrameSummary {
    /// Summarise one frame.
    #[must_use]
    pub fn from_record(record: &ImageRecord) -> Self {
        let mean = if record.pixels.is_empty() {
            0.0
        } else {
            record.pixels.iter().map(|&p| f64::from(p)).sum::<f64>() / record.pixels.len() as f64
        };
        Self {
            sequence: record.sequence,
            width: record.width,
            height: record.height,
            mean,
            acquisition_date: record
                .metadata
                .get(metadata::ACQUISITION_DATE)
                .and_then(serde_json::Value::as_f64),
        }
    }
}

impl std::fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{:<6} {}x{}  mean {:.2}",
            self.sequence, self.width, self.height, self.mean
        )?;
        if let Some(date) = self.acquisition_date {
            write!(f, "  t0 {date:.6}")?;
        }
        Ok(())
    }
}

/// Print every mirrored setting of the connected system.
pub fn print_info(system: &StreakCamera) {
    println!("RemoteEx software version: {}", system.software_version());

    println!("\n[streak unit]");
    print_parameters(system.streak_unit().as_ref());
    if let Some(delay_generator) = system.delay_generator() {
        println!("\n[delay generator]");
        print_parameters(delay_generator.as_ref());
    }
    if let Some(camera) = system.readout_camera() {
        println!("\n[readout camera]");
        print_parameters(camera.as_ref());
    }
}

fn print_parameters(component: &dyn Parameterized) {
    for (name, value) in component.parameters().snapshot() {
        println!("  {name:<24} {value}");
    }
}

/// Acquire `frames` images and return their summaries.
///
/// With `triggered` the camera is armed on its software trigger and fired
/// once per frame; otherwise it runs free and the first `frames` images are
/// kept. `frame_timeout` bounds the wait for each image.
#[instrument(skip(system), err)]
pub async fn acquire(
    system: &StreakCamera,
    frames: usize,
    triggered: bool,
    frame_timeout: Duration,
) -> Result<Vec<FrameSummary>> {
    let camera = system
        .readout_camera()
        .ok_or_else(|| anyhow!("No readout camera is configured"))?;

    let mut images = camera
        .subscribe_images()
        .await
        .ok_or_else(|| anyhow!("Readout camera does not publish images"))?;

    if triggered {
        camera.arm().await?;
    }
    camera.start_stream().await.context("Failed to start acquisition")?;

    let collected = collect(camera.as_ref(), &mut images, frames, triggered, frame_timeout).await;

    let stopped = camera.stop_stream().await;
    if triggered {
        camera.disarm().await?;
    }
    let summaries = collected?;
    stopped.context("Failed to stop acquisition")?;
    info!(frames = summaries.len(), "Acquisition finished");
    Ok(summaries)
}

async fn collect<C>(
    camera: &C,
    images: &mut tokio::sync::broadcast::Receiver<std::sync::Arc<ImageRecord>>,
    frames: usize,
    triggered: bool,
    frame_timeout: Duration,
) -> Result<Vec<FrameSummary>>
where
    C: Triggerable + ?Sized,
{
    let mut summaries = Vec::with_capacity(frames);
    while summaries.len() < frames {
        if triggered {
            camera.trigger().await?;
        }
        let record = match tokio::time::timeout(frame_timeout, images.recv()).await {
            Ok(Ok(record)) => record,
            Ok(Err(RecvError::Lagged(n))) => {
                warn!("Skipped {} frames", n);
                continue;
            }
            Ok(Err(RecvError::Closed)) => return Err(anyhow!("Image stream closed")),
            Err(_) => {
                return Err(anyhow!(
                    "No image within {:?} ({} of {} received)",
                    frame_timeout,
                    summaries.len(),
                    frames
                ))
            }
        };
        summaries.push(FrameSummary::from_record(&record));
    }
    Ok(summaries)
}
