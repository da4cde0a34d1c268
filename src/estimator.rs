//! Trip duration placeholder.
//!
//! Not a routing engine: the estimate only has to be stable, because booking
//! end times and availability searches must agree on the same interval.

use crate::model::{HOUR_MS, Ms};

/// Shortest trip the estimator will report, so every booking has a non-empty span.
pub const MIN_TRIP_HOURS: i64 = 1;

/// Estimated trip duration between two location codes, in milliseconds.
pub fn estimate(origin: &str, destination: &str) -> Ms {
    estimate_hours(origin, destination) * HOUR_MS
}

/// `|destination - origin| % 24` hours, floored at [`MIN_TRIP_HOURS`].
pub fn estimate_hours(origin: &str, destination: &str) -> i64 {
    let from = code_value(origin);
    let to = code_value(destination);
    let hours = (from.abs_diff(to) % 24) as i64;
    hours.max(MIN_TRIP_HOURS)
}

/// Numeric value of a location code: its leading digits, or a CRC-32 of the
/// whole code when it does not start with a representable number.
fn code_value(code: &str) -> u64 {
    let code = code.trim();
    let digits_end = code
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(code.len(), |(i, _)| i);
    code[..digits_end]
        .parse::<u64>()
        .unwrap_or_else(|_| crc32fast::hash(code.as_bytes()) as u64)
}
