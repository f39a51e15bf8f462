//! Conversions between seconds and the `"<value> <unit>"` strings RemoteEx uses
//! for exposure times and time ranges.

use crate::error::{RemoteExError, RxResult};

const UNITS: [&str; 4] = ["s", "ms", "us", "ns"];

/// Convert a device value and unit (`"20"`, `"ns"`) to seconds.
pub fn unit_to_seconds(value: &str, unit: &str) -> RxResult<f64> {
    let index = UNITS
        .iter()
        .position(|u| *u == unit)
        .ok_or_else(|| RemoteExError::InvalidValue(format!("unsupported unit '{unit}' for value {value}")))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| RemoteExError::InvalidValue(format!("'{value}' is not a number ({e})")))?;
    Ok(value / 10f64.powi(3 * index as i32))
}

/// Parse a `"<value> <unit>"` reply field into seconds.
pub fn parse_time(field: &str) -> RxResult<f64> {
    let mut parts = field.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(value), Some(unit)) => unit_to_seconds(value, unit),
        _ => Err(RemoteExError::InvalidValue(format!(
            "'{field}' is not a '<value> <unit>' time"
        ))),
    }
}

/// Convert seconds to the string RemoteEx accepts.
///
/// Between 1 ns and 1 s the value is rounded to an integer count of the
/// matching unit (`2e-8` -> `"20 ns"`). From 1 s upwards it is written in
/// seconds with three decimals. The separating space is required by
/// `DevParamSet`.
pub fn seconds_to_unit(value: f64) -> RxResult<String> {
    if (1e-9..1.0).contains(&value) {
        let magnitude = (value.log10() / 3.0).floor().max(-3.0);
        let index = (-magnitude) as usize;
        let unit = UNITS
            .get(index)
            .ok_or_else(|| RemoteExError::InvalidValue(format!("no unit for {value} s")))?;
        let scaled = (value * 10f64.powi(3 * index as i32)).round();
        Ok(format!("{} {}", scaled as i64, unit))
    } else if value >= 1.0 {
        Ok(format!("{value:.3} s"))
    } else {
        Err(RemoteExError::InvalidValue(format!(
            "time {value} s cannot be expressed in RemoteEx units"
        )))
    }
}

/// Float comparison with a relative tolerance of 1e-5 (absolute 1e-18 near zero).
pub fn almost_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-18 + 1e-5 * a.abs().max(b.abs())
}

/// Element of `candidates` closest to `value`.
pub fn find_closest(value: f64, candidates: impl IntoIterator<Item = f64>) -> Option<f64> {
    candidates
        .into_iter()
        .min_by(|a, b| (a - value).abs().total_cmp(&(b - value).abs()))
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_times() {
        assert_eq!(unit_to_seconds("20", "ns").unwrap(), 20e-9);
        assert_eq!(unit_to_seconds("1", "us").unwrap(), 1e-6);
        assert_eq!(parse_time("100 ms").unwrap(), 0.1);
        assert_eq!(parse_time("2 s").unwrap(), 2.0);
        assert!(unit_to_seconds("1", "ps").is_err());
        assert!(parse_time("7").is_err());
    }

    #[test]
    fn formats_times() {
        assert_eq!(seconds_to_unit(2e-8).unwrap(), "20 ns");
        assert_eq!(seconds_to_unit(5e-6).unwrap(), "5 us");
        assert_eq!(seconds_to_unit(1e-9).unwrap(), "1 ns");
        assert_eq!(seconds_to_unit(0.1).unwrap(), "100 ms");
        assert_eq!(seconds_to_unit(2.5).unwrap(), "2.500 s");
        assert!(seconds_to_unit(1e-10).is_err());
        assert!(seconds_to_unit(-1.0).is_err());
    }

    #[test]
    fn closest_and_tolerance() {
        assert_eq!(find_closest(1.000001e-6, [1e-3, 1e-6]), Some(1e-6));
        assert_eq!(find_closest(5e-4, [1e-3, 1e-6]), Some(1e-3));
        assert_eq!(find_closest(1.0, Vec::new()), None);
        assert!(almost_equal(1.000001e-6, 1e-6));
        assert!(!almost_equal(5e-4, 1e-3));
        assert!(almost_equal(0.0, 0.0));
    }
}
