//! Typed RemoteEx commands.
//!
//! Thin wrappers over [`CommandInvoker::invoke`]; each one names the command
//! and converts the reply fields the components need.

use std::time::{Duration, Instant};

use crate::error::{RemoteExError, RxResult};
use crate::invoker::CommandInvoker;
use crate::protocol::{Command, WireValue, STATUS_BUSY};

/// `AppStart` loads the HPD-TA application, which takes ~15 s.
pub const APP_START_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `start_acquisition` waits for a running command to finish.
pub const START_RETRY_TIMEOUT: Duration = Duration::from_secs(5);

const STATUS_POLL: Duration = Duration::from_millis(10);

/// Acquisition modes of `AcqStart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqMode {
    /// Continuous live images.
    Live,
    /// One live image.
    SingleLive,
}

impl AcqMode {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "Live",
            Self::SingleLive => "SingleLive",
        }
    }
}

/// Reply of `AsyncCommandStatus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncStatus {
    /// An asynchronous command is still pending.
    pub pending: bool,
    /// It is being prepared.
    pub preparing: bool,
    /// It is running.
    pub active: bool,
    /// Name of the command, if reported.
    pub command: Option<String>,
}

/// Reply of `ImgRingBufferGet(Data,seq)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingBufferImage {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per pixel as reported.
    pub bytes_per_pixel: u32,
    /// Image type code.
    pub kind: String,
    /// Sequence number actually returned.
    pub sequence: String,
    /// Device timestamp.
    pub timestamp: Option<String>,
}

impl RingBufferImage {
    /// Bytes sent on the data socket (16-bit pixels).
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }
}

fn field<'a>(fields: &'a [String], index: usize, command: &str) -> RxResult<&'a str> {
    fields.get(index).map(String::as_str).ok_or_else(|| {
        RemoteExError::InvalidValue(format!("{command} reply has no field {index}: {fields:?}"))
    })
}

fn parse_field<T: std::str::FromStr>(fields: &[String], index: usize, command: &str) -> RxResult<T>
where
    T::Err: std::fmt::Display,
{
    let raw = field(fields, index, command)?;
    raw.trim().parse().map_err(|e| {
        RemoteExError::InvalidValue(format!("{command} field {index} '{raw}' not understood: {e}"))
    })
}

pub(crate) fn first_field(fields: Vec<String>, command: &str) -> RxResult<String> {
    fields
        .into_iter()
        .next()
        .ok_or_else(|| RemoteExError::InvalidValue(format!("{command} returned no value")))
}

fn flag(fields: &[String], index: usize) -> bool {
    fields
        .get(index)
        .and_then(|f| f.trim().parse::<i64>().ok())
        .is_some_and(|v| v != 0)
}

impl CommandInvoker {
    /// Start the HPD-TA application, optionally with an INI file.
    ///
    /// If it is already running RemoteEx answers `parameters ignored`.
    pub async fn app_start(&self, ini_file: Option<&str>, wait: Duration) -> RxResult<Vec<String>> {
        let command = match ini_file {
            Some(ini) => Command::new("AppStart").arg(1_i32).arg(ini),
            None => Command::new("AppStart"),
        };
        self.invoke_with_timeout(command, wait).await
    }

    /// Close the HPD-TA application.
    pub async fn app_end(&self) -> RxResult<()> {
        self.invoke(Command::new("AppEnd")).await.map(|_| ())
    }

    /// Application information, e.g. `Version`.
    pub async fn app_info(&self, parameter: &str) -> RxResult<Vec<String>> {
        self.invoke(Command::new("AppInfo").arg(parameter)).await
    }

    /// License status: the first two fields are `1` when the key is found.
    pub async fn app_licence_get(&self) -> RxResult<Vec<String>> {
        self.invoke(Command::new("AppLicenceGet")).await
    }

    /// Whether an asynchronous command (acquisition) is still running.
    pub async fn async_command_status(&self) -> RxResult<AsyncStatus> {
        let fields = self.invoke(Command::new("AsyncCommandStatus")).await?;
        Ok(AsyncStatus {
            pending: flag(&fields, 0),
            preparing: flag(&fields, 1),
            active: flag(&fields, 2),
            command: fields.get(3).cloned().filter(|c| !c.is_empty()),
        })
    }

    /// Start an acquisition.
    pub async fn acq_start(&self, mode: AcqMode) -> RxResult<()> {
        self.invoke(Command::new("AcqStart").arg(mode.as_str()))
            .await
            .map(|_| ())
    }

    /// Stop the running acquisition, letting RemoteEx wait up to `wait`.
    pub async fn acq_stop(&self, wait: Duration) -> RxResult<()> {
        self.invoke(Command::new("AcqStop").arg(wait.as_millis() as u64))
            .await
            .map(|_| ())
    }

    /// Publish every new live image in a RemoteEx ring buffer of `buffers` images.
    pub async fn acq_live_monitor_ring_buffer(&self, buffers: u32) -> RxResult<()> {
        self.invoke(
            Command::new("acqLiveMonitor")
                .arg("RingBuffer")
                .arg(buffers),
        )
        .await
        .map(|_| ())
    }

    /// Read a camera parameter.
    pub async fn cam_param_get(&self, location: &str, parameter: &str) -> RxResult<Vec<String>> {
        self.invoke(Command::new("CamParamGet").arg(location).arg(parameter))
            .await
    }

    /// First field of `CamParamGet`, the current value.
    pub async fn cam_param_value(&self, location: &str, parameter: &str) -> RxResult<String> {
        first_field(self.cam_param_get(location, parameter).await?, "CamParamGet")
    }

    /// Write a camera parameter.
    pub async fn cam_param_set(
        &self,
        location: &str,
        parameter: &str,
        value: impl WireValue,
    ) -> RxResult<()> {
        self.invoke(
            Command::new("CamParamSet")
                .arg(location)
                .arg(parameter)
                .arg(value),
        )
        .await
        .map(|_| ())
    }

    /// Label, value, type and limits or choices of a camera parameter.
    pub async fn cam_param_info_ex(&self, location: &str, parameter: &str) -> RxResult<Vec<String>> {
        self.invoke(Command::new("CamParamInfoEx").arg(location).arg(parameter))
            .await
    }

    /// Camera parameters available at `location`.
    pub async fn cam_params_list(&self, location: &str) -> RxResult<Vec<String>> {
        self.invoke(Command::new("CamParamsList").arg(location)).await
    }

    /// Read a device parameter (streak unit, delay box).
    pub async fn dev_param_get(&self, location: &str, parameter: &str) -> RxResult<Vec<String>> {
        self.invoke(Command::new("DevParamGet").arg(location).arg(parameter))
            .await
    }

    /// First field of `DevParamGet`, the current value.
    pub async fn dev_param_value(&self, location: &str, parameter: &str) -> RxResult<String> {
        first_field(self.dev_param_get(location, parameter).await?, "DevParamGet")
    }

    /// Write a device parameter.
    pub async fn dev_param_set(
        &self,
        location: &str,
        parameter: &str,
        value: impl WireValue,
    ) -> RxResult<()> {
        self.invoke(
            Command::new("DevParamSet")
                .arg(location)
                .arg(parameter)
                .arg(value),
        )
        .await
        .map(|_| ())
    }

    /// Label, value, type and limits or choices of a device parameter.
    pub async fn dev_param_info_ex(&self, location: &str, parameter: &str) -> RxResult<Vec<String>> {
        self.invoke(Command::new("DevParamInfoEx").arg(location).arg(parameter))
            .await
    }

    /// Device parameters available at `location`.
    pub async fn dev_params_list(&self, location: &str) -> RxResult<Vec<String>> {
        self.invoke(Command::new("DevParamsList").arg(location)).await
    }

    /// Request image `sequence` from the ring buffer; the pixels follow on the
    /// data socket.
    ///
    /// Returns `None` when RemoteEx answers without image information.
    pub async fn img_ring_buffer_get(&self, sequence: &str) -> RxResult<Option<RingBufferImage>> {
        const NAME: &str = "ImgRingBufferGet";
        let fields = self
            .invoke(Command::new(NAME).arg("Data").arg(sequence))
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(RingBufferImage {
            width: parse_field(&fields, 0, NAME)?,
            height: parse_field(&fields, 1, NAME)?,
            bytes_per_pixel: parse_field(&fields, 2, NAME)?,
            kind: field(&fields, 3, NAME)?.to_string(),
            sequence: field(&fields, 4, NAME)?.to_string(),
            timestamp: fields.get(5).cloned(),
        }))
    }

    /// Request the vertical scaling table of the current image; returns the
    /// number of `f32` values that follow on the data socket.
    pub async fn img_data_get_scaling_table(&self) -> RxResult<usize> {
        const NAME: &str = "ImgDataGet";
        let fields = self
            .invoke(
                Command::new(NAME)
                    .arg("current")
                    .arg("ScalingTable")
                    .arg("Vertical"),
            )
            .await?;
        parse_field(&fields, 0, NAME)
    }

    /// Start an acquisition, stopping a still running one first.
    ///
    /// When RemoteEx answers "command cannot be executed" (status 7), the
    /// running acquisition is stopped, `AsyncCommandStatus` is polled until it
    /// reports idle, then `AcqStart` is sent once more. If it does not become
    /// idle within [`START_RETRY_TIMEOUT`] an error is logged and nothing is
    /// started.
    pub async fn start_acquisition(&self, mode: AcqMode) -> RxResult<()> {
        match self.acq_start(mode).await {
            Err(e) if e.status_code() == Some(STATUS_BUSY) => {
                tracing::debug!(
                    "Starting acquisition currently not possible, will stop and restart {} mode",
                    mode.as_str()
                );
            }
            other => return other,
        }

        self.acq_stop(Duration::from_secs(1)).await?;
        let start = Instant::now();
        while self.async_command_status().await?.pending {
            if start.elapsed() > START_RETRY_TIMEOUT {
                tracing::error!("Could not start acquisition.");
                return Ok(());
            }
            tokio::time::sleep(STATUS_POLL).await;
        }
        self.acq_start(mode).await
    }

    /// Wait until no asynchronous command is pending.
    ///
    /// Every `stop_after` the running acquisition (most likely live mode) is
    /// stopped. Gives up with a warning after `attempts` stops.
    pub async fn wait_async_idle(&self, stop_after: Duration, attempts: u32) -> RxResult<bool> {
        let mut start = Instant::now();
        let mut stops = 0;
        while self.async_command_status().await?.pending {
            tracing::debug!("Asynchronous RemoteEx command still in process. Wait until finished.");
            if start.elapsed() > stop_after {
                if stops >= attempts {
                    tracing::warn!("RemoteEx still busy after {} stops, going on anyway", stops);
                    return Ok(false);
                }
                self.acq_stop(Duration::from_secs(1)).await?;
                stops += 1;
                start = Instant::now();
            }
            tokio::time::sleep(STATUS_POLL).await;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_fields() {
        let fields: Vec<String> = vec!["672".into(), "x".into()];
        assert_eq!(parse_field::<u32>(&fields, 0, "Test").unwrap(), 672);
        assert!(parse_field::<u32>(&fields, 1, "Test").is_err());
        assert!(parse_field::<u32>(&fields, 2, "Test").is_err());
    }

    #[test]
    fn flags_default_to_false() {
        let fields: Vec<String> = vec!["1".into(), "0".into(), "".into()];
        assert!(flag(&fields, 0));
        assert!(!flag(&fields, 1));
        assert!(!flag(&fields, 2));
        assert!(!flag(&fields, 5));
    }

    #[test]
    fn ring_buffer_byte_len() {
        let info = RingBufferImage {
            width: 4,
            height: 4,
            bytes_per_pixel: 2,
            kind: "2".into(),
            sequence: "123".into(),
            timestamp: None,
        };
        assert_eq!(info.byte_len(), 32);
        assert_eq!(AcqMode::SingleLive.as_str(), "SingleLive");
    }
}
