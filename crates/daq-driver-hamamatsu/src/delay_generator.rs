//! Delay generator (RemoteEx device location `Delaybox`).
//!
//! The delay generator is driven externally by the e-beam blanker, so its
//! repetition rate is read-only. Each delay output the device lists becomes a
//! [`Parameter<f64>`] in seconds. The trigger delay can follow the streak unit
//! time range through a calibration table installed with
//! [`DelayGenerator::update_metadata`].

use anyhow::{Context, Result};
use daq_core::capabilities::Parameterized;
use daq_core::error::DaqError;
use daq_core::observable::ParameterSet;
use daq_core::parameter::Parameter;
use daq_core::Metadata;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{instrument, Instrument};

use crate::error::{RemoteExError, RxResult};
use crate::invoker::CommandInvoker;
use crate::metadata;
use crate::units::{almost_equal, find_closest};

/// RemoteEx device location of the delay generator.
pub const LOCATION: &str = "Delaybox";

/// Period of the settings poll.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Largest delay range reported, whatever the device claims.
pub const MAX_DELAY: f64 = 10.0;

/// RemoteEx delay names and the parameter each one maps to. `Delay A` (DG645)
/// and `Delay Time` (synchroscan) are both the trigger delay.
pub const DELAY_NAMES: [(&str, &str); 9] = [
    ("Delay A", "trigger_delay"),
    ("Delay Time", "trigger_delay"),
    ("Delay B", "delay_b"),
    ("Delay C", "delay_c"),
    ("Delay D", "delay_d"),
    ("Delay E", "delay_e"),
    ("Delay F", "delay_f"),
    ("Delay G", "delay_g"),
    ("Delay H", "delay_h"),
];

/// Parameter name of the calibrated delay.
pub const TRIGGER_DELAY: &str = "trigger_delay";

/// Time range (s) -> trigger delay (s) pairs.
pub type Calibration = Vec<(f64, f64)>;

fn parse_number(raw: &str, what: &str) -> RxResult<f64> {
    raw.trim()
        .parse()
        .map_err(|e| RemoteExError::InvalidValue(format!("{what} '{raw}' is not a number ({e})")))
}

async fn read_delay(invoker: &CommandInvoker, rx_name: &str) -> RxResult<f64> {
    parse_number(&invoker.dev_param_value(LOCATION, rx_name).await?, rx_name)
}

async fn read_trigger_rate(invoker: &CommandInvoker) -> RxResult<f64> {
    parse_number(
        &invoker.dev_param_value(LOCATION, "Repetition Rate").await?,
        "Repetition Rate",
    )
}

/// Parse and check a calibration table against the trigger delay range.
///
/// Keys are time ranges in seconds (JSON object keys are strings), values
/// must be numbers inside `range`.
pub fn parse_calibration(table: &Value, range: (f64, f64)) -> RxResult<Calibration> {
    let Some(entries) = table.as_object() else {
        return Err(RemoteExError::InvalidCalibration(format!(
            "{} must be a map of time range to trigger delay",
            metadata::TIME_RANGE_TO_DELAY
        )));
    };
    let mut calibration = Calibration::with_capacity(entries.len());
    for (time_range, delay) in entries {
        let key: f64 = time_range.trim().parse().map_err(|_| {
            RemoteExError::InvalidCalibration(format!("Time range {time_range} is not a number."))
        })?;
        let Some(delay) = delay.as_f64() else {
            return Err(RemoteExError::InvalidCalibration(format!(
                "Trigger delay {delay} corresponding to time range {time_range} is not of type \
                 float. Please check calibration file for trigger delay."
            )));
        };
        if !(range.0..=range.1).contains(&delay) {
            return Err(RemoteExError::InvalidCalibration(format!(
                "Trigger delay {delay} corresponding to time range {time_range} is not in range \
                 {range:?}. Please check the calibration file for the trigger delay."
            )));
        }
        calibration.push((key, delay));
    }
    Ok(calibration)
}

/// Delay matching `time_range` within tolerance, if any.
pub fn calibrated_delay(calibration: &Calibration, time_range: f64) -> Option<f64> {
    let key = find_closest(time_range, calibration.iter().map(|(t, _)| *t))?;
    if !almost_equal(key, time_range) {
        return None;
    }
    calibration
        .iter()
        .find(|(t, _)| *t == key)
        .map(|(_, delay)| *delay)
}

/// Write a delay and read back what the device applied.
async fn write_delay(delay: &Parameter<f64>, value: f64) -> Result<f64> {
    delay.set(value).await?;
    delay.refresh_from_hardware().await?;
    Ok(delay.get())
}

#[derive(Clone)]
struct Mirrors {
    trigger_rate: Option<Parameter<f64>>,
    delays: Vec<(&'static str, Parameter<f64>)>,
}

impl Mirrors {
    async fn refresh(&self) {
        tracing::debug!("Updating delay generator settings");
        if let Some(rate) = &self.trigger_rate {
            if let Err(e) = rate.refresh_from_hardware().await {
                tracing::error!("Unexpected failure when polling delay generator settings: {}", e);
            }
        }
        for (rx_name, delay) in &self.delays {
            if let Err(e) = delay.refresh_from_hardware().await {
                tracing::error!("Unexpected failure when polling {}: {}", rx_name, e);
            }
        }
    }

    fn trigger_delay(&self) -> Option<&Parameter<f64>> {
        self.delays
            .iter()
            .find(|(_, p)| p.name() == TRIGGER_DELAY)
            .map(|(_, p)| p)
    }
}

/// Delay generator mirror.
pub struct DelayGenerator {
    mirrors: Mirrors,
    params: ParameterSet,
    metadata: Arc<RwLock<Metadata>>,
    calibration: Arc<RwLock<Calibration>>,
    poll: Mutex<Option<JoinHandle<()>>>,
    follower: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DelayGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayGenerator")
            .field("delays", &self.params.names())
            .field("calibration", &self.calibration.read().len())
            .finish()
    }
}

impl DelayGenerator {
    /// Configure the delay box for external triggering, mirror its delays
    /// and start polling them.
    #[instrument(skip(invoker), err)]
    pub async fn new(invoker: Arc<CommandInvoker>) -> Result<Self> {
        let hw_version = invoker
            .dev_param_value(LOCATION, "DeviceName")
            .await
            .context("Failed to read delay generator name")?;
        let available = invoker.dev_params_list(LOCATION).await?;
        let has = |name: &str| available.iter().any(|p| p == name);

        if has("Setting") {
            invoker.dev_param_set(LOCATION, "Setting", "M1").await?;
        }
        if has("Trig. Mode") {
            invoker.dev_param_set(LOCATION, "Trig. Mode", "Ext. rising").await?;
        }
        if has("Delay A") {
            invoker.dev_param_set(LOCATION, "Delay A", 0_i64).await?;
        }
        if has("Delay B") {
            invoker.dev_param_set(LOCATION, "Delay B", 0.00000002).await?;
        }
        if has("Burst Mode") {
            invoker.dev_param_set(LOCATION, "Burst Mode", "Off").await?;
        }

        let trigger_rate = if has("Repetition Rate") {
            let mut rate = Parameter::new("trigger_rate", read_trigger_rate(&invoker).await?)
                .with_description("Repetition rate, set by the e-beam blanker")
                .with_unit("Hz")
                .read_only();
            let reader = invoker.clone();
            rate.connect_to_hardware_read(move || {
                let invoker = reader.clone();
                Box::pin(async move { Ok(read_trigger_rate(&invoker).await?) })
            });
            Some(rate)
        } else {
            None
        };

        let mut delays: Vec<(&'static str, Parameter<f64>)> = Vec::new();
        for (rx_name, name) in DELAY_NAMES {
            if !has(rx_name) || delays.iter().any(|(_, p)| p.name() == name) {
                continue;
            }
            delays.push((rx_name, Self::delay_parameter(&invoker, rx_name, name).await?));
        }

        let mut params = ParameterSet::new();
        if let Some(rate) = &trigger_rate {
            params.register(rate.clone());
        }
        for (_, delay) in &delays {
            params.register(delay.clone());
        }

        let metadata = Arc::new(RwLock::new(Metadata::new()));
        metadata
            .write()
            .insert(metadata::HW_VERSION.into(), json!(hw_version));

        let mirrors = Mirrors {
            trigger_rate,
            delays,
        };
        mirrors.refresh().await;
        let poll = tokio::spawn(Self::poll_loop(mirrors.clone()));

        tracing::info!("Delay generator {} ready", hw_version);
        Ok(Self {
            mirrors,
            params,
            metadata,
            calibration: Arc::new(RwLock::new(Calibration::new())),
            poll: Mutex::new(Some(poll)),
            follower: Mutex::new(None),
        })
    }

    async fn delay_parameter(
        invoker: &Arc<CommandInvoker>,
        rx_name: &'static str,
        name: &'static str,
    ) -> Result<Parameter<f64>> {
        let info = invoker.dev_param_info_ex(LOCATION, rx_name).await?;
        let max = info
            .last()
            .map(|raw| parse_number(raw, rx_name))
            .transpose()?
            .with_context(|| format!("No range reported for {rx_name}"))?
            .min(MAX_DELAY);
        let range = (0.0, max);

        let mut delay = read_delay(invoker, rx_name).await?;
        if !(range.0..=range.1).contains(&delay) {
            tracing::info!("Delay {} is not in range {:?}, clipping it", delay, range);
            delay = delay.clamp(range.0, range.1);
        }

        let mut param = Parameter::new(name, delay)
            .with_description(format!("{rx_name} output"))
            .with_unit("s")
            .with_range_introspectable(range.0, range.1);
        let writer = invoker.clone();
        let reader = invoker.clone();
        param.connect_to_hardware(
            move |value: f64| {
                let invoker = writer.clone();
                Box::pin(async move {
                    invoker.dev_param_set(LOCATION, rx_name, value).await?;
                    Ok(())
                })
            },
            move || {
                let invoker = reader.clone();
                Box::pin(async move { Ok(read_delay(&invoker, rx_name).await?) })
            },
        );
        Ok(param)
    }

    async fn poll_loop(mirrors: Mirrors) {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
        loop {
            ticker.tick().await;
            mirrors.refresh().await;
        }
    }

    /// Repetition rate, when the device reports one.
    pub fn trigger_rate(&self) -> Option<&Parameter<f64>> {
        self.mirrors.trigger_rate.as_ref()
    }

    /// The calibrated delay (`Delay A` or `Delay Time`).
    pub fn trigger_delay(&self) -> Option<&Parameter<f64>> {
        self.mirrors.trigger_delay()
    }

    /// Every mirrored delay output.
    pub fn delays(&self) -> impl Iterator<Item = &Parameter<f64>> {
        self.mirrors.delays.iter().map(|(_, p)| p)
    }

    /// Delay by parameter name, e.g. `delay_b`.
    pub fn delay(&self, name: &str) -> Option<&Parameter<f64>> {
        self.mirrors
            .delays
            .iter()
            .find(|(_, p)| p.name() == name)
            .map(|(_, p)| p)
    }

    /// Set a delay and return the value read back from the device.
    #[instrument(skip(self), err)]
    pub async fn set_delay(&self, name: &str, seconds: f64) -> Result<f64> {
        let delay = self
            .delay(name)
            .with_context(|| format!("Delay generator has no delay named {name}"))?;
        write_delay(delay, seconds).await
    }

    /// Snapshot of the delay generator metadata.
    pub fn metadata(&self) -> Metadata {
        self.metadata.read().clone()
    }

    /// Merge `md` into the metadata. A calibration table under
    /// [`metadata::TIME_RANGE_TO_DELAY`] is validated first and rejected as a
    /// whole if any delay is not a number inside the trigger delay range.
    pub fn update_metadata(&self, md: &Metadata) -> Result<(), DaqError> {
        if let Some(table) = md.get(metadata::TIME_RANGE_TO_DELAY) {
            let range = self
                .trigger_delay()
                .and_then(|delay| delay.range())
                .ok_or_else(|| {
                    DaqError::from(RemoteExError::InvalidCalibration(
                        "no trigger delay to calibrate".into(),
                    ))
                })?;
            *self.calibration.write() = parse_calibration(table, range)?;
        }
        let mut current = self.metadata.write();
        for (key, value) in md {
            current.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    /// Follow `time_range`: whenever it changes, apply the calibrated trigger
    /// delay. Replaces any previous subscription.
    pub fn follow_time_range(&self, mut time_range: watch::Receiver<f64>) {
        let Some(trigger_delay) = self.trigger_delay().cloned() else {
            tracing::debug!("No trigger delay, time range changes are not followed");
            return;
        };
        let calibration = self.calibration.clone();
        let follower = async move {
            while time_range.changed().await.is_ok() {
                let value = *time_range.borrow_and_update();
                let delay = {
                    let calibration = calibration.read();
                    if calibration.is_empty() {
                        continue;
                    }
                    calibrated_delay(&calibration, value)
                };
                match delay {
                    Some(delay) => {
                        if let Err(e) = write_delay(&trigger_delay, delay).await {
                            tracing::error!(
                                "Failed to apply trigger delay {} for time range {}: {}",
                                delay,
                                value,
                                e
                            );
                        }
                    }
                    None => tracing::warn!(
                        "Time range {} is not a key in MD for time range to trigger delay \
                         calibration",
                        value
                    ),
                }
            }
        };
        let task = tokio::spawn(follower.in_current_span());
        if let Some(previous) = self.follower.lock().replace(task) {
            previous.abort();
        }
    }

    /// Re-read every setting now.
    pub async fn update_settings(&self) {
        self.mirrors.refresh().await;
    }

    /// Stop polling and following the time range.
    pub fn terminate(&self) {
        if let Some(poll) = self.poll.lock().take() {
            poll.abort();
        }
        if let Some(follower) = self.follower.lock().take() {
            follower.abort();
        }
    }
}

impl Drop for DelayGenerator {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl Parameterized for DelayGenerator {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}
