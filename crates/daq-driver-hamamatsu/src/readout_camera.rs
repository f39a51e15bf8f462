//! Readout camera (OrcaFlash behind the streak tube).
//!
//! Settings live at two RemoteEx locations: `Setup` (binning, sensor
//! geometry) and `Live` (exposure time of live acquisitions). Images come from
//! the [`AcquisitionEngine`]; each one carries the camera metadata merged with
//! the current streak unit settings.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use daq_core::capabilities::{ExposureControl, FrameProducer, Parameterized, Triggerable};
use daq_core::error::DaqError;
use daq_core::observable::ParameterSet;
use daq_core::parameter::Parameter;
use daq_core::{ImageRecord, Metadata};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::instrument;

use crate::acquisition::{AcquisitionEngine, AcquisitionState, FrameContext, SoftwareTrigger};
use crate::commands::AcqMode;
use crate::delay_generator::DelayGenerator;
use crate::error::RemoteExError;
use crate::invoker::CommandInvoker;
use crate::metadata::{self, merge_metadata};
use crate::streak_unit::StreakUnit;
use crate::units::{parse_time, seconds_to_unit};

/// Location of the camera setup parameters.
pub const SETUP: &str = "Setup";

/// Location of the live-mode parameters.
pub const LIVE: &str = "Live";

/// Physical pixel pitch of the sensor (m).
pub const SENSOR_PIXEL_SIZE: f64 = 6.5e-6;

/// Pixel readout rate (Hz).
pub const READOUT_RATE: f64 = 425e6;

/// Camera binning, horizontal by vertical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binning {
    /// Horizontal (wavelength) binning.
    pub h: u32,
    /// Vertical (time) binning.
    pub v: u32,
}

impl Binning {
    /// Binning `h x v`.
    pub const fn new(h: u32, v: u32) -> Self {
        Self { h, v }
    }
}

impl std::fmt::Display for Binning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} x {}", self.h, self.v)
    }
}

impl std::str::FromStr for Binning {
    type Err = RemoteExError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RemoteExError::InvalidValue(format!("binning '{s}' is not 'h x v'"));
        let (h, v) = s.split_once('x').ok_or_else(invalid)?;
        Ok(Self {
            h: h.trim().parse().map_err(|_| invalid())?,
            v: v.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// Parse the multi-line `CameraInfo` text into hardware and software versions.
fn split_camera_info(info: &str) -> (Option<String>, Option<String>) {
    let lines: Vec<&str> = info.split("\r\n").collect();
    let hw = lines.get(0..3).map(|l| l.join(", "));
    let sw = lines.get(3..5).map(|l| l.join(", "));
    (hw, sw)
}

async fn read_size(invoker: &CommandInvoker) -> Result<(u32, u32)> {
    let width = invoker.cam_param_value(SETUP, "HWidth").await?;
    let height = invoker.cam_param_value(SETUP, "VWidth").await?;
    Ok((
        width.trim().parse().context("HWidth is not an integer")?,
        height.trim().parse().context("VWidth is not an integer")?,
    ))
}

async fn read_exposure(invoker: &CommandInvoker) -> Result<f64, RemoteExError> {
    let raw = invoker.cam_param_value(LIVE, "Exposure").await?;
    parse_time(&raw).map_err(|_| {
        RemoteExError::InvalidValue(format!(
            "Exposure time of {raw} is not supported for read-out camera."
        ))
    })
}

struct CameraContext {
    metadata: Arc<RwLock<Metadata>>,
    exposure: Parameter<f64>,
    streak_unit: Arc<StreakUnit>,
}

impl FrameContext for CameraContext {
    fn frame_metadata(&self) -> Metadata {
        let mut md = self.metadata.read().clone();
        merge_metadata(&mut md, &self.streak_unit.metadata());
        md
    }

    fn exposure_time(&self) -> f64 {
        self.exposure.get()
    }

    fn streak_mode(&self) -> bool {
        self.streak_unit.streak_mode().get()
    }

    fn time_scale_factor(&self) -> f64 {
        self.streak_unit.time_scale_factor()
    }
}

/// Readout camera of the streak system.
pub struct ReadoutCamera {
    streak_unit: Arc<StreakUnit>,
    delay_generator: Option<Arc<DelayGenerator>>,
    engine: AcquisitionEngine,
    binning: Parameter<Binning>,
    resolution: Parameter<(u32, u32)>,
    exposure_time: Parameter<f64>,
    readout_rate: Parameter<f64>,
    params: ParameterSet,
    metadata: Arc<RwLock<Metadata>>,
    trigger: SoftwareTrigger,
}

impl std::fmt::Debug for ReadoutCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadoutCamera")
            .field("binning", &self.binning.get())
            .field("resolution", &self.resolution.get())
            .field("exposure_time", &self.exposure_time.get())
            .field("engine", &self.engine)
            .finish()
    }
}

impl ReadoutCamera {
    /// Identify and configure the camera.
    #[instrument(skip_all, err)]
    pub async fn new(
        invoker: Arc<CommandInvoker>,
        streak_unit: Arc<StreakUnit>,
        delay_generator: Option<Arc<DelayGenerator>>,
        ring_buffers: u32,
    ) -> Result<Self> {
        let camera_info = match invoker.cam_param_value(SETUP, "CameraInfo").await {
            Ok(info) => info,
            Err(e) => {
                tracing::error!("Failed to get readout camera info: {}", e);
                return Err(RemoteExError::NotReady(
                    "Failed to find readout camera, check it is powered. If powered, restart \
                     the Hamamatsu PC"
                        .into(),
                )
                .into());
            }
        };
        let (hw_version, sw_version) = split_camera_info(&camera_info);
        if hw_version.is_none() {
            tracing::debug!("Could not get hardware information for streak readout camera.");
        }

        let available = invoker.cam_params_list(SETUP).await?;
        let has = |name: &str| available.iter().any(|p| p == name);
        if has("TimingMode") {
            invoker
                .cam_param_set(SETUP, "TimingMode", "Internal timing")
                .await?;
        }
        if has("ShowGainOffset") {
            invoker.cam_param_set(SETUP, "ShowGainOffset", "True").await?;
        }
        invoker.cam_param_set(SETUP, "ScanMode", "Subarray").await?;

        // full sensor size is only reported without binning
        invoker
            .cam_param_set(SETUP, "Binning", Binning::new(1, 1).to_string())
            .await?;
        let sensor_size = read_size(&invoker).await?;
        tracing::debug!(
            "Readout camera offset: {}, {}",
            invoker.cam_param_value(SETUP, "HOffs").await?,
            invoker.cam_param_value(SETUP, "VOffs").await?
        );

        invoker
            .cam_param_set(SETUP, "Binning", Binning::new(2, 2).to_string())
            .await?;
        let binning: Binning = invoker.cam_param_value(SETUP, "Binning").await?.parse()?;
        let binning_choices = invoker
            .cam_param_info_ex(SETUP, "Binning")
            .await?
            .iter()
            .skip(4)
            .map(|raw| raw.parse::<Binning>())
            .collect::<Result<Vec<_>, _>>()?;
        let resolution = Parameter::new("resolution", read_size(&invoker).await?)
            .with_description("Image size (width, height) after binning")
            .read_only();

        let exposure_info = invoker.cam_param_info_ex(LIVE, "Exposure").await?;
        let (min_exp, max_exp) = match (exposure_info.get(4), exposure_info.last()) {
            (Some(min), Some(max)) => (parse_time(min)?, parse_time(max)?),
            _ => bail!("Exposure range missing from {:?}", exposure_info),
        };
        let mut exposure_time = Parameter::new("exposure_time", read_exposure(&invoker).await?)
            .with_description("Exposure time of live acquisitions")
            .with_unit("s")
            .with_range_introspectable(min_exp, max_exp);
        let (writer, reader) = (invoker.clone(), invoker.clone());
        exposure_time.connect_to_hardware(
            move |seconds: f64| {
                let invoker = writer.clone();
                Box::pin(async move {
                    let raw = seconds_to_unit(seconds).map_err(|_| {
                        RemoteExError::InvalidValue(format!(
                            "Exposure time of {seconds} sec is not supported for read-out camera."
                        ))
                    })?;
                    invoker.cam_param_set(LIVE, "Exposure", raw).await?;
                    Ok(())
                })
            },
            move || {
                let invoker = reader.clone();
                Box::pin(async move { Ok(read_exposure(&invoker).await?) })
            },
        );

        let readout_rate = Parameter::new("readout_rate", READOUT_RATE)
            .with_description("Pixel readout rate")
            .with_unit("Hz")
            .read_only();

        let mut md = Metadata::new();
        if let Some(hw) = hw_version {
            md.insert(metadata::HW_VERSION.into(), json!(hw));
        }
        if let Some(sw) = sw_version {
            md.insert(metadata::SW_VERSION.into(), json!(sw));
        }
        md.insert(
            metadata::SENSOR_SIZE.into(),
            json!([sensor_size.0, sensor_size.1]),
        );
        md.insert(
            metadata::SENSOR_PIXEL_SIZE.into(),
            json!([SENSOR_PIXEL_SIZE, SENSOR_PIXEL_SIZE]),
        );
        md.insert(metadata::BINNING.into(), json!([binning.h, binning.v]));
        md.insert(
            metadata::EXPOSURE_TIME.into(),
            json!(exposure_time.get()),
        );
        md.insert(metadata::READOUT_TIME.into(), json!(1.0 / READOUT_RATE));
        let metadata = Arc::new(RwLock::new(md));

        let context = Arc::new(CameraContext {
            metadata: metadata.clone(),
            exposure: exposure_time.clone(),
            streak_unit: streak_unit.clone(),
        });
        let engine = AcquisitionEngine::new(invoker.clone(), context, ring_buffers)?;

        let binning =
            Self::binning_parameter(&invoker, binning, binning_choices, &resolution, &engine);

        let md = metadata.clone();
        exposure_time
            .add_change_listener(move |seconds: &f64| {
                md.write()
                    .insert(metadata::EXPOSURE_TIME.into(), json!(seconds));
            })
            .await;
        let md = metadata.clone();
        binning
            .add_change_listener(move |b: &Binning| {
                md.write()
                    .insert(metadata::BINNING.into(), json!([b.h, b.v]));
            })
            .await;

        let mut params = ParameterSet::new();
        params.register(binning.clone());
        params.register(resolution.clone());
        params.register(exposure_time.clone());
        params.register(readout_rate.clone());

        tracing::info!(
            "Readout camera ready, sensor {}x{}, binning {}",
            sensor_size.0,
            sensor_size.1,
            binning.get()
        );
        Ok(Self {
            streak_unit,
            delay_generator,
            engine,
            binning,
            resolution,
            exposure_time,
            readout_rate,
            params,
            metadata,
            trigger: SoftwareTrigger::new(),
        })
    }

    fn binning_parameter(
        invoker: &Arc<CommandInvoker>,
        initial: Binning,
        choices: Vec<Binning>,
        resolution: &Parameter<(u32, u32)>,
        engine: &AcquisitionEngine,
    ) -> Parameter<Binning> {
        let mut param = Parameter::new("binning", initial)
            .with_description("Binning (horizontal x vertical)")
            .with_choices(choices);
        let (writer, reader) = (invoker.clone(), invoker.clone());
        let resolution = resolution.clone();
        let state = engine.state_receiver();
        param.connect_to_hardware(
            move |binning: Binning| {
                let invoker = writer.clone();
                let resolution = resolution.clone();
                let live = *state.borrow() == AcquisitionState::FreeRunning;
                Box::pin(async move {
                    // binning can only change while the camera is stopped
                    if live {
                        invoker.acq_stop(Duration::from_secs(1)).await?;
                        invoker
                            .cam_param_set(SETUP, "Binning", binning.to_string())
                            .await?;
                        invoker.start_acquisition(AcqMode::Live).await?;
                    } else {
                        invoker
                            .cam_param_set(SETUP, "Binning", binning.to_string())
                            .await?;
                    }
                    let size = read_size(&invoker)
                        .await
                        .map_err(|e| DaqError::Instrument(e.to_string()))?;
                    resolution.update_from_device(size).await;
                    Ok(())
                })
            },
            move || {
                let invoker = reader.clone();
                Box::pin(async move {
                    let raw = invoker.cam_param_value(SETUP, "Binning").await?;
                    Ok(raw.parse::<Binning>()?)
                })
            },
        );
        param
    }

    /// Binning.
    pub fn binning(&self) -> &Parameter<Binning> {
        &self.binning
    }

    /// Image size after binning (read-only).
    pub fn resolution_parameter(&self) -> &Parameter<(u32, u32)> {
        &self.resolution
    }

    /// Exposure time (s).
    pub fn exposure_time(&self) -> &Parameter<f64> {
        &self.exposure_time
    }

    /// Readout rate (Hz, read-only).
    pub fn readout_rate(&self) -> &Parameter<f64> {
        &self.readout_rate
    }

    /// The camera's own software trigger, used by [`Triggerable`].
    pub fn software_trigger(&self) -> &SoftwareTrigger {
        &self.trigger
    }

    /// Acquisition state.
    pub fn acquisition_state(&self) -> AcquisitionState {
        self.engine.state()
    }

    /// Gate acquisitions on `trigger`, or run free with `None`.
    pub async fn synchronize(&self, trigger: Option<SoftwareTrigger>) {
        self.engine.synchronize(trigger).await;
    }

    /// Snapshot of the camera metadata (without the streak unit part).
    pub fn metadata(&self) -> Metadata {
        self.metadata.read().clone()
    }

    /// Merge `md` into the camera metadata.
    pub fn update_metadata(&self, md: &Metadata) {
        let mut current = self.metadata.write();
        for (key, value) in md {
            current.insert(key.clone(), value.clone());
        }
    }

    async fn record_trigger_rate(&self) {
        let Some(rate) = self.delay_generator.as_ref().and_then(|dg| dg.trigger_rate()) else {
            return;
        };
        match rate.refresh_from_hardware().await {
            Ok(_) => {
                self.metadata
                    .write()
                    .insert(metadata::TRIGGER_RATE.into(), json!(rate.get()));
            }
            Err(e) => tracing::error!("Failed to update trigger rate: {}", e),
        }
    }

    /// Stop acquiring and end the acquisition task.
    pub async fn terminate(&self) {
        self.engine.terminate().await;
    }
}

#[async_trait]
impl FrameProducer for ReadoutCamera {
    #[instrument(skip(self), err)]
    async fn start_stream(&self) -> Result<()> {
        self.record_trigger_rate().await;
        self.engine.start().await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn stop_stream(&self) -> Result<()> {
        let stopped = self.engine.stop().await;
        // no gain left on the MCP once images are no longer taken
        self.streak_unit
            .mcp_gain()
            .set(0)
            .await
            .context("Failed to reset MCP gain")?;
        stopped?;
        Ok(())
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution.get()
    }

    async fn subscribe_images(&self) -> Option<broadcast::Receiver<Arc<ImageRecord>>> {
        Some(self.engine.subscribe())
    }

    fn receiver_count(&self) -> usize {
        self.engine.receiver_count()
    }

    async fn is_streaming(&self) -> Result<bool> {
        Ok(self.engine.is_active())
    }

    fn frame_count(&self) -> u64 {
        self.engine.frame_count()
    }
}

#[async_trait]
impl ExposureControl for ReadoutCamera {
    async fn set_exposure(&self, seconds: f64) -> Result<()> {
        self.exposure_time.set(seconds).await
    }

    async fn get_exposure(&self) -> Result<f64> {
        Ok(self.exposure_time.get())
    }
}

#[async_trait]
impl Triggerable for ReadoutCamera {
    async fn arm(&self) -> Result<()> {
        self.engine.synchronize(Some(self.trigger.clone())).await;
        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        if !self.engine.is_gated() {
            bail!("Camera is not armed");
        }
        if self.trigger.fire() == 0 {
            return Err(anyhow!("Trigger has no listener"));
        }
        Ok(())
    }

    async fn disarm(&self) -> Result<()> {
        self.engine.synchronize(None).await;
        Ok(())
    }

    async fn is_armed(&self) -> Result<bool> {
        Ok(self.engine.is_gated())
    }
}

impl Parameterized for ReadoutCamera {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}
