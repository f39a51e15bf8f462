//! The streak camera system: one RemoteEx connection shared by the streak
//! unit, the optional delay generator and the optional readout camera.

use anyhow::{Context, Result};
use daq_core::capabilities::Parameterized;
use daq_core::driver::DeviceLifecycle;
use daq_core::error::DaqError;
use daq_core::observable::ParameterSet;
use daq_core::Metadata;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::instrument;

use crate::commands::first_field;
use crate::delay_generator::DelayGenerator;
use crate::error::RemoteExError;
use crate::factory::HamamatsuRxConfig;
use crate::invoker::CommandInvoker;
use crate::metadata;
use crate::readout_camera::ReadoutCamera;
use crate::streak_unit::StreakUnit;

/// Connected streak camera system. Clones share the same hardware.
#[derive(Clone)]
pub struct StreakCamera {
    invoker: Arc<CommandInvoker>,
    software_version: Arc<str>,
    streak_unit: Arc<StreakUnit>,
    delay_generator: Option<Arc<DelayGenerator>>,
    readout_camera: Option<Arc<ReadoutCamera>>,
    params: Arc<ParameterSet>,
    terminated: Arc<AtomicBool>,
}

impl std::fmt::Debug for StreakCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreakCamera")
            .field("software_version", &self.software_version)
            .field("streak_unit", &self.streak_unit)
            .field("delay_generator", &self.delay_generator)
            .field("readout_camera", &self.readout_camera)
            .finish()
    }
}

type Optionals = (Option<Arc<DelayGenerator>>, Option<Arc<ReadoutCamera>>);

impl StreakCamera {
    /// Connect to RemoteEx, start HPD-TA and bring up every configured
    /// component. On failure everything already started is shut down again.
    #[instrument(skip(config), fields(host = %config.host, port = config.port), err)]
    pub async fn connect(config: &HamamatsuRxConfig) -> Result<Self> {
        let invoker = Arc::new(
            CommandInvoker::connect(&config.host, config.port, config.command_timeout())
                .await
                .context("Failed to initialise Hamamatsu streak camera")?,
        );
        match Self::bring_up(invoker.clone(), config).await {
            Ok(camera) => Ok(camera),
            Err(e) => {
                if let Err(end) = invoker.app_end().await {
                    tracing::info!("AppEnd failed: {}", end);
                }
                invoker.shutdown().await;
                Err(e)
            }
        }
    }

    async fn bring_up(invoker: Arc<CommandInvoker>, config: &HamamatsuRxConfig) -> Result<Self> {
        invoker
            .app_start(config.settings_ini.as_deref(), config.app_start_timeout())
            .await
            .context("Failed to start HPD-TA")?;

        if invoker.log().has_communication_error() {
            return Err(RemoteExError::NotReady(
                "HPD-TA reports a communication error with the camera. Check the cables, then \
                 restart the Hamamatsu PC."
                    .into(),
            )
            .into());
        }

        let licence = invoker.app_licence_get().await?;
        if !licence.iter().take(2).any(|f| f.trim() == "1") {
            return Err(RemoteExError::NotReady(format!(
                "No license found for HPD-TA ({licence:?}), check the license dongle is plugged in"
            ))
            .into());
        }

        let software_version = first_field(invoker.app_info("Version").await?, "AppInfo")?;
        tracing::info!("HPD-TA version {}", software_version);

        let streak_unit = Arc::new(
            StreakUnit::new(invoker.clone(), config.streak_unit.time_range_table()?)
                .await
                .context("Failed to initialise streak unit")?,
        );
        let (delay_generator, readout_camera) =
            match Self::bring_up_optionals(&invoker, &streak_unit, config).await {
                Ok(optionals) => optionals,
                Err(e) => {
                    if let Err(t) = streak_unit.terminate().await {
                        tracing::warn!("Failed to make streak unit safe: {}", t);
                    }
                    return Err(e);
                }
            };

        let mut params = ParameterSet::new();
        params.register(streak_unit.streak_mode().clone());
        params.register(streak_unit.mcp_gain().clone());
        params.register(streak_unit.time_range().clone());
        if let Some(shutter) = streak_unit.shutter() {
            params.register(shutter.clone());
        }
        if let Some(dg) = &delay_generator {
            if let Some(rate) = dg.trigger_rate() {
                params.register(rate.clone());
            }
            for delay in dg.delays() {
                params.register(delay.clone());
            }
        }
        if let Some(camera) = &readout_camera {
            params.register(camera.binning().clone());
            params.register(camera.resolution_parameter().clone());
            params.register(camera.exposure_time().clone());
            params.register(camera.readout_rate().clone());
        }

        Ok(Self {
            invoker,
            software_version: software_version.into(),
            streak_unit,
            delay_generator,
            readout_camera,
            params: Arc::new(params),
            terminated: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn bring_up_optionals(
        invoker: &Arc<CommandInvoker>,
        streak_unit: &Arc<StreakUnit>,
        config: &HamamatsuRxConfig,
    ) -> Result<Optionals> {
        let delay_generator = if config.delay_generator.enabled {
            let dg = Arc::new(
                DelayGenerator::new(invoker.clone())
                    .await
                    .context("Failed to initialise delay generator")?,
            );
            if let Some(table) = &config.delay_generator.time_range_to_delay {
                let mut md = Metadata::new();
                md.insert(
                    metadata::TIME_RANGE_TO_DELAY.into(),
                    serde_json::to_value(table)?,
                );
                if let Err(e) = dg.update_metadata(&md) {
                    dg.terminate();
                    return Err(e).context("Invalid trigger delay calibration");
                }
            }
            dg.follow_time_range(streak_unit.time_range().subscribe());
            Some(dg)
        } else {
            None
        };

        let readout_camera = if config.readout_camera.enabled {
            match ReadoutCamera::new(
                invoker.clone(),
                streak_unit.clone(),
                delay_generator.clone(),
                config.readout_camera.ring_buffers,
            )
            .await
            {
                Ok(camera) => Some(Arc::new(camera)),
                Err(e) => {
                    if let Some(dg) = &delay_generator {
                        dg.terminate();
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok((delay_generator, readout_camera))
    }

    /// HPD-TA version reported by `AppInfo(Version)`.
    pub fn software_version(&self) -> &str {
        &self.software_version
    }

    /// Streak unit.
    pub fn streak_unit(&self) -> &Arc<StreakUnit> {
        &self.streak_unit
    }

    /// Delay generator, when enabled.
    pub fn delay_generator(&self) -> Option<&Arc<DelayGenerator>> {
        self.delay_generator.as_ref()
    }

    /// Readout camera, when enabled.
    pub fn readout_camera(&self) -> Option<&Arc<ReadoutCamera>> {
        self.readout_camera.as_ref()
    }

    /// Command channel, for commands the components do not wrap.
    pub fn invoker(&self) -> &Arc<CommandInvoker> {
        &self.invoker
    }

    /// Leave the hardware safe and close the connection. Safe to call twice.
    #[instrument(skip(self), err)]
    pub async fn shutdown(&self) -> Result<(), DaqError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Shutting down streak camera");

        let mut errors = Vec::new();
        if let Some(camera) = &self.readout_camera {
            camera.terminate().await;
        }
        if let Some(dg) = &self.delay_generator {
            dg.terminate();
        }
        if let Err(e) = self.streak_unit.terminate().await {
            errors.push(e);
        }
        if let Err(e) = self.invoker.app_end().await {
            tracing::info!("AppEnd failed: {}", e);
        }
        self.invoker.shutdown().await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

impl Parameterized for StreakCamera {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

impl DeviceLifecycle for StreakCamera {
    fn on_unregister(&self) -> BoxFuture<'static, Result<()>> {
        let camera = self.clone();
        Box::pin(async move { Ok(camera.shutdown().await?) })
    }
}
