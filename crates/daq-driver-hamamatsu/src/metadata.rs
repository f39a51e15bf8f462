//! Metadata keys attached to acquired images.

use daq_core::Metadata;
use serde_json::Value;

/// Hardware model name.
pub const HW_NAME: &str = "hw_name";
/// Hardware version or device name.
pub const HW_VERSION: &str = "hw_version";
/// Software version.
pub const SW_VERSION: &str = "sw_version";
/// Exposure time (s).
pub const EXPOSURE_TIME: &str = "exposure_time";
/// Sensor readout time (s).
pub const READOUT_TIME: &str = "readout_time";
/// Binning as `[h, v]`.
pub const BINNING: &str = "binning";
/// Full sensor size in pixels as `[width, height]`.
pub const SENSOR_SIZE: &str = "sensor_size";
/// Pixel pitch (m) as `[x, y]`.
pub const SENSOR_PIXEL_SIZE: &str = "sensor_pixel_size";
/// Trigger (repetition) rate of the delay generator (Hz).
pub const TRIGGER_RATE: &str = "trigger_rate";
/// MCP gain of the streak unit.
pub const STREAK_MCP_GAIN: &str = "streak_mcp_gain";
/// Sweep time range (s).
pub const STREAK_TIME_RANGE: &str = "streak_time_range";
/// Whether the streak unit was sweeping.
pub const STREAK_MODE: &str = "streak_mode";
/// Time (s) of each image row, in streak mode.
pub const TIME_LIST: &str = "time_list";
/// Start of the exposure, seconds since the Unix epoch.
pub const ACQUISITION_DATE: &str = "acquisition_date";
/// Calibration table: time range (s) -> trigger delay (s).
pub const TIME_RANGE_TO_DELAY: &str = "time_range_to_delay";

const IDENTITY_KEYS: [&str; 3] = [HW_NAME, HW_VERSION, SW_VERSION];

/// Merge `upstream` into `md`.
///
/// Keys missing from `md` are copied. For the identity keys both values are
/// kept, joined with `", "`. For every other key `md` keeps its value.
pub fn merge_metadata(md: &mut Metadata, upstream: &Metadata) {
    for (key, value) in upstream {
        match md.get_mut(key) {
            None => {
                md.insert(key.clone(), value.clone());
            }
            Some(current) if IDENTITY_KEYS.contains(&key.as_str()) => {
                let joined = format!("{}, {}", as_text(current), as_text(value));
                *current = Value::String(joined);
            }
            Some(_) => {}
        }
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_joins_identity_and_keeps_own_values() {
        let mut md = Metadata::new();
        md.insert(HW_VERSION.into(), json!("C13440"));
        md.insert(EXPOSURE_TIME.into(), json!(0.1));

        let mut unit = Metadata::new();
        unit.insert(HW_VERSION.into(), json!("C10910"));
        unit.insert(EXPOSURE_TIME.into(), json!(9.9));
        unit.insert(STREAK_MCP_GAIN.into(), json!(12));

        merge_metadata(&mut md, &unit);
        assert_eq!(md[HW_VERSION], json!("C13440, C10910"));
        assert_eq!(md[EXPOSURE_TIME], json!(0.1));
        assert_eq!(md[STREAK_MCP_GAIN], json!(12));
    }
}
