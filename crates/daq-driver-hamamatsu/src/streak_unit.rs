//! Streak unit (RemoteEx device location `Streakcamera`).
//!
//! Mirrors the sweep settings of the streak tube: operate/focus mode, MCP
//! gain, time range and, on single-sweep units, the shutter. Every setting is
//! written through immediately and re-read every 5 s; a poll only notifies
//! subscribers when the device value differs from the mirror.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use daq_core::capabilities::{Parameterized, ShutterControl};
use daq_core::error::DaqError;
use daq_core::observable::ParameterSet;
use daq_core::parameter::Parameter;
use daq_core::Metadata;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::error::{RemoteExError, RxResult};
use crate::invoker::CommandInvoker;
use crate::metadata;
use crate::units::{almost_equal, find_closest, unit_to_seconds};

/// RemoteEx device location of the streak unit.
pub const LOCATION: &str = "Streakcamera";

/// Period of the settings poll.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Time the mechanical shutter needs to move.
pub const SHUTTER_SETTLE: Duration = Duration::from_millis(150);

/// Time-axis unit assumed when it cannot be derived from the time range.
pub const FALLBACK_TIME_SCALE: f64 = 1e-12;

/// Position of the streak unit shutter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterState {
    /// Light reaches the photocathode.
    Open,
    /// Photocathode protected.
    Closed,
}

impl ShutterState {
    fn as_wire(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for ShutterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Time range ids of synchroscan units, mapped to seconds.
pub type TimeRangeTable = BTreeMap<u32, f64>;

fn time_id_to_time(table: &TimeRangeTable, id: u32) -> RxResult<f64> {
    table
        .get(&id)
        .copied()
        .ok_or_else(|| RemoteExError::InvalidValue(format!("Time ID {id} is not in time_ranges")))
}

fn time_to_time_id(table: &TimeRangeTable, seconds: f64) -> RxResult<u32> {
    table
        .iter()
        .find(|(_, t)| almost_equal(**t, seconds))
        .map(|(id, _)| *id)
        .ok_or_else(|| {
            RemoteExError::InvalidValue(format!("Time {seconds} s is not in time_ranges"))
        })
}

/// Parse a time range as reported by RemoteEx: `"<value> <unit>"`, or a bare
/// range id on synchroscan units.
fn parse_time_range(raw: &str, table: &TimeRangeTable) -> RxResult<f64> {
    let parts: Vec<&str> = raw.split_whitespace().collect();
    match parts.as_slice() {
        [id] => {
            let id = id.parse::<u32>().map_err(|e| {
                RemoteExError::InvalidValue(format!("time range '{raw}' not understood: {e}"))
            })?;
            time_id_to_time(table, id)
        }
        [value, unit, ..] => unit_to_seconds(value, unit),
        [] => Err(RemoteExError::InvalidValue("empty time range".into())),
    }
}

fn parse_streak_mode(raw: &str) -> bool {
    match raw {
        "Focus" => false,
        "Operate" => true,
        other => {
            tracing::warn!("Unexpected streak mode {}", other);
            true
        }
    }
}

fn parse_shutter(raw: &str) -> ShutterState {
    match raw {
        "Closed" => ShutterState::Closed,
        "Open" => ShutterState::Open,
        other => {
            tracing::warn!("Unexpected shutter mode {}. Assuming it's open.", other);
            ShutterState::Open
        }
    }
}

/// Unit prefix of the scaling table values, guessed from the time range.
pub fn time_scale_factor(time_range: f64, synchroscan: bool) -> f64 {
    if synchroscan {
        return FALLBACK_TIME_SCALE;
    }
    if (1e-15..1.0).contains(&time_range) {
        let decade = (time_range.log10() / 3.0).floor() as i32 * 3;
        10f64.powi(decade)
    } else {
        tracing::warn!(
            "Unexpected time range of {} s, will guess time scale is in ps",
            time_range
        );
        FALLBACK_TIME_SCALE
    }
}

async fn read_time_range(invoker: &CommandInvoker, table: &TimeRangeTable) -> RxResult<f64> {
    let raw = invoker.dev_param_value(LOCATION, "Time Range").await?;
    parse_time_range(&raw, table)
}

/// The settings, cheap to clone into the polling task.
#[derive(Clone)]
struct Mirrors {
    streak_mode: Parameter<bool>,
    mcp_gain: Parameter<i64>,
    time_range: Parameter<f64>,
    shutter: Option<Parameter<ShutterState>>,
}

impl Mirrors {
    async fn refresh(&self) {
        tracing::debug!("Updating streak unit settings");
        let results = [
            self.time_range.refresh_from_hardware().await,
            self.mcp_gain.refresh_from_hardware().await,
            self.streak_mode.refresh_from_hardware().await,
        ];
        for result in results {
            if let Err(e) = result {
                tracing::error!("Unexpected failure when polling streak unit settings: {}", e);
            }
        }
        if let Some(shutter) = &self.shutter {
            if let Err(e) = shutter.refresh_from_hardware().await {
                tracing::error!("Unexpected failure when polling streak unit shutter: {}", e);
            }
        }
    }
}

/// Streak unit mirror.
pub struct StreakUnit {
    invoker: Arc<CommandInvoker>,
    time_ranges: Arc<TimeRangeTable>,
    mirrors: Mirrors,
    params: ParameterSet,
    metadata: Arc<RwLock<Metadata>>,
    poll: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StreakUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreakUnit")
            .field("streak_mode", &self.mirrors.streak_mode.get())
            .field("mcp_gain", &self.mirrors.mcp_gain.get())
            .field("time_range", &self.mirrors.time_range.get())
            .finish()
    }
}

impl StreakUnit {
    /// Put the unit in a safe state (focus mode, no gain, shutter closed),
    /// read its settings and start polling them.
    #[instrument(skip(invoker, time_ranges), err)]
    pub async fn new(invoker: Arc<CommandInvoker>, time_ranges: TimeRangeTable) -> Result<Self> {
        let time_ranges = Arc::new(time_ranges);
        let hw_version = invoker
            .dev_param_value(LOCATION, "DeviceName")
            .await
            .context("Failed to read streak unit name")?;
        let available = invoker.dev_params_list(LOCATION).await?;
        let has = |name: &str| available.iter().any(|p| p == name);

        invoker.dev_param_set(LOCATION, "MCP Gain", 0_i64).await?;
        invoker.dev_param_set(LOCATION, "Mode", "Focus").await?;
        if has("Trig. Mode") {
            invoker.dev_param_set(LOCATION, "Trig. Mode", "Cont").await?;
        }
        if has("Trig. level") {
            invoker.dev_param_set(LOCATION, "Trig. level", 1_i64).await?;
        }
        if has("Trig. slope") {
            invoker.dev_param_set(LOCATION, "Trig. slope", "Rising").await?;
        }

        let shutter = if has("Shutter") {
            invoker.dev_param_set(LOCATION, "Shutter", "Closed").await?;
            let raw = invoker.dev_param_value(LOCATION, "Shutter").await?;
            tracing::debug!("Shutter state is {}.", raw);
            Some(Self::shutter_parameter(&invoker, parse_shutter(&raw)))
        } else {
            None
        };

        let mode = parse_streak_mode(&invoker.dev_param_value(LOCATION, "Mode").await?);
        let gain: i64 = invoker
            .dev_param_value(LOCATION, "MCP Gain")
            .await?
            .trim()
            .parse()
            .context("MCP gain is not an integer")?;
        let gain_info = invoker.dev_param_info_ex(LOCATION, "MCP Gain").await?;
        let gain_range = match gain_info.get(5..7) {
            Some([min, max]) => (
                min.trim().parse::<i64>().context("MCP gain minimum")?,
                max.trim().parse::<i64>().context("MCP gain maximum")?,
            ),
            _ => return Err(anyhow!("MCP gain range missing from {:?}", gain_info)),
        };

        let current_range = read_time_range(&invoker, &time_ranges).await?;
        let range_info = invoker.dev_param_info_ex(LOCATION, "Time Range").await?;
        let choices = range_info
            .iter()
            .skip(6)
            .map(|raw| parse_time_range(raw, &time_ranges))
            .collect::<RxResult<Vec<f64>>>()?;
        let time_range =
            find_closest(current_range, choices.iter().copied()).unwrap_or(current_range);

        let mcp_gain = Self::gain_parameter(&invoker, gain, gain_range);
        let streak_mode = Self::mode_parameter(&invoker, mode, mcp_gain.clone());
        let time_range = Self::time_range_parameter(&invoker, &time_ranges, time_range, choices);

        let metadata = Arc::new(RwLock::new(Metadata::new()));
        metadata
            .write()
            .insert(metadata::HW_VERSION.into(), json!(hw_version));
        Self::track(&mcp_gain, &metadata, metadata::STREAK_MCP_GAIN).await;
        Self::track(&time_range, &metadata, metadata::STREAK_TIME_RANGE).await;
        Self::track(&streak_mode, &metadata, metadata::STREAK_MODE).await;

        let mut params = ParameterSet::new();
        params.register(streak_mode.clone());
        params.register(mcp_gain.clone());
        params.register(time_range.clone());
        if let Some(shutter) = &shutter {
            params.register(shutter.clone());
        }

        let mirrors = Mirrors {
            streak_mode,
            mcp_gain,
            time_range,
            shutter,
        };
        mirrors.refresh().await;
        let poll = tokio::spawn(Self::poll_loop(mirrors.clone()));

        tracing::info!("Streak unit {} ready", hw_version);
        Ok(Self {
            invoker,
            time_ranges,
            mirrors,
            params,
            metadata,
            poll: Mutex::new(Some(poll)),
        })
    }

    async fn poll_loop(mirrors: Mirrors) {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
        loop {
            ticker.tick().await;
            mirrors.refresh().await;
        }
    }

    async fn track<T>(param: &Parameter<T>, md: &Arc<RwLock<Metadata>>, key: &'static str)
    where
        T: Clone + Send + Sync + PartialEq + std::fmt::Debug + Serialize + 'static,
    {
        md.write().insert(key.into(), json!(param.get()));
        let md = md.clone();
        param
            .add_change_listener(move |value: &T| {
                tracing::debug!("Reporting {} {:?} for streak unit.", key, value);
                md.write().insert(key.into(), json!(value));
            })
            .await;
    }

    fn gain_parameter(invoker: &Arc<CommandInvoker>, gain: i64, range: (i64, i64)) -> Parameter<i64> {
        let mut param = Parameter::new("mcp_gain", gain)
            .with_description("Micro-channel plate gain")
            .with_range_introspectable(range.0, range.1);
        let writer = invoker.clone();
        let reader = invoker.clone();
        param.connect_to_hardware(
            move |value: i64| {
                let invoker = writer.clone();
                Box::pin(async move {
                    invoker.dev_param_set(LOCATION, "MCP Gain", value).await?;
                    Ok(())
                })
            },
            move || {
                let invoker = reader.clone();
                Box::pin(async move {
                    let raw = invoker.dev_param_value(LOCATION, "MCP Gain").await?;
                    raw.trim().parse::<i64>().map_err(|e| {
                        DaqError::from(RemoteExError::InvalidValue(format!(
                            "MCP gain '{raw}': {e}"
                        )))
                    })
                })
            },
        );
        param
    }

    fn mode_parameter(
        invoker: &Arc<CommandInvoker>,
        mode: bool,
        mcp_gain: Parameter<i64>,
    ) -> Parameter<bool> {
        let mut param = Parameter::new("streak_mode", mode)
            .with_description("Sweeping (Operate) instead of Focus mode");
        let writer = invoker.clone();
        let reader = invoker.clone();
        param.connect_to_hardware(
            move |operate: bool| {
                let invoker = writer.clone();
                let mcp_gain = mcp_gain.clone();
                Box::pin(async move {
                    if operate {
                        invoker.dev_param_set(LOCATION, "Mode", "Operate").await?;
                    } else {
                        // never leave gain on outside of sweeping
                        mcp_gain
                            .set(0)
                            .await
                            .map_err(|e| DaqError::Instrument(e.to_string()))?;
                        invoker.dev_param_set(LOCATION, "Mode", "Focus").await?;
                    }
                    Ok(())
                })
            },
            move || {
                let invoker = reader.clone();
                Box::pin(async move {
                    let raw = invoker.dev_param_value(LOCATION, "Mode").await?;
                    Ok(parse_streak_mode(&raw))
                })
            },
        );
        param
    }

    fn time_range_parameter(
        invoker: &Arc<CommandInvoker>,
        table: &Arc<TimeRangeTable>,
        initial: f64,
        choices: Vec<f64>,
    ) -> Parameter<f64> {
        let mut param = Parameter::new("time_range", initial)
            .with_description("Sweep time range")
            .with_unit("s")
            .with_choices(choices);
        let (writer, writer_table) = (invoker.clone(), table.clone());
        let (reader, reader_table) = (invoker.clone(), table.clone());
        param.connect_to_hardware(
            move |seconds: f64| {
                let invoker = writer.clone();
                let table = writer_table.clone();
                Box::pin(async move {
                    let raw = if table.is_empty() {
                        crate::units::seconds_to_unit(seconds)
                    } else {
                        time_to_time_id(&table, seconds).map(|id| id.to_string())
                    }
                    .map_err(|e| {
                        RemoteExError::InvalidValue(format!(
                            "Time range of {seconds} sec is not supported ({e})."
                        ))
                    })?;
                    invoker.dev_param_set(LOCATION, "Time Range", raw).await?;
                    Ok(())
                })
            },
            move || {
                let invoker = reader.clone();
                let table = reader_table.clone();
                Box::pin(async move { Ok(read_time_range(&invoker, &table).await?) })
            },
        );
        param
    }

    fn shutter_parameter(invoker: &Arc<CommandInvoker>, initial: ShutterState) -> Parameter<ShutterState> {
        let mut param =
            Parameter::new("shutter", initial).with_description("Streak unit input shutter");
        let writer = invoker.clone();
        let reader = invoker.clone();
        param.connect_to_hardware(
            move |state: ShutterState| {
                let invoker = writer.clone();
                Box::pin(async move {
                    invoker
                        .dev_param_set(LOCATION, "Shutter", state.as_wire())
                        .await?;
                    tracing::debug!("Setting shutter to: {}.", state);
                    tokio::time::sleep(SHUTTER_SETTLE).await;
                    Ok(())
                })
            },
            move || {
                let invoker = reader.clone();
                Box::pin(async move {
                    let raw = invoker.dev_param_value(LOCATION, "Shutter").await?;
                    Ok(parse_shutter(&raw))
                })
            },
        );
        param
    }

    /// Operate (sweeping) or Focus mode.
    pub fn streak_mode(&self) -> &Parameter<bool> {
        &self.mirrors.streak_mode
    }

    /// MCP gain.
    pub fn mcp_gain(&self) -> &Parameter<i64> {
        &self.mirrors.mcp_gain
    }

    /// Sweep time range in seconds.
    pub fn time_range(&self) -> &Parameter<f64> {
        &self.mirrors.time_range
    }

    /// Shutter, on units where software controls it.
    pub fn shutter(&self) -> Option<&Parameter<ShutterState>> {
        self.mirrors.shutter.as_ref()
    }

    /// Whether the unit has a software-controlled shutter.
    pub fn has_shutter(&self) -> bool {
        self.mirrors.shutter.is_some()
    }

    /// Snapshot of the unit metadata.
    pub fn metadata(&self) -> Metadata {
        self.metadata.read().clone()
    }

    /// Unit of the scaling table values, in seconds.
    pub fn time_scale_factor(&self) -> f64 {
        time_scale_factor(self.mirrors.time_range.get(), !self.time_ranges.is_empty())
    }

    /// Re-read every setting now.
    pub async fn update_settings(&self) {
        self.mirrors.refresh().await;
    }

    /// Stop polling and leave the unit safe: no gain, Focus mode, shutter closed.
    #[instrument(skip(self), err)]
    pub async fn terminate(&self) -> Result<(), DaqError> {
        if let Some(poll) = self.poll.lock().take() {
            poll.abort();
        }

        let mut errors = Vec::new();
        match self.invoker.dev_param_set(LOCATION, "MCP Gain", 0_i64).await {
            Ok(()) => {
                self.mirrors.mcp_gain.update_from_device(0).await;
            }
            Err(e) => errors.push(e.into()),
        }
        match self.invoker.dev_param_set(LOCATION, "Mode", "Focus").await {
            Ok(()) => {
                self.mirrors.streak_mode.update_from_device(false).await;
            }
            Err(e) => errors.push(e.into()),
        }
        if let Some(shutter) = &self.mirrors.shutter {
            match self.invoker.dev_param_set(LOCATION, "Shutter", "Closed").await {
                Ok(()) => {
                    shutter.update_from_device(ShutterState::Closed).await;
                }
                Err(e) => errors.push(e.into()),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }

    fn shutter_or_err(&self) -> Result<&Parameter<ShutterState>> {
        self.mirrors
            .shutter
            .as_ref()
            .ok_or_else(|| anyhow!("This streak unit has no software-controlled shutter"))
    }
}

impl Drop for StreakUnit {
    fn drop(&mut self) {
        if let Some(poll) = self.poll.lock().take() {
            poll.abort();
        }
    }
}

impl Parameterized for StreakUnit {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

#[async_trait]
impl ShutterControl for StreakUnit {
    #[instrument(skip(self), err)]
    async fn open_shutter(&self) -> Result<()> {
        self.shutter_or_err()?.set(ShutterState::Open).await
    }

    #[instrument(skip(self), err)]
    async fn close_shutter(&self) -> Result<()> {
        self.shutter_or_err()?.set(ShutterState::Closed).await
    }

    #[instrument(skip(self), err)]
    async fn is_shutter_open(&self) -> Result<bool> {
        let shutter = self.shutter_or_err()?;
        shutter.refresh_from_hardware().await?;
        Ok(shutter.get() == ShutterState::Open)
    }
}
