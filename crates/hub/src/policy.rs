//! Automation decision engine: pure mapping from (config, telemetry payload,
//! wall clock) to a desired pin state. No I/O here; the ingest pipeline owns
//! persistence and relay.
//!
//! Rules, taken from the device contract:
//! - automation runs only when at least one of the two flags is enabled AND
//!   the report carries a `lux` field; otherwise the pin is left untouched
//! - schedule-only: on while inside `[start, end)` (wrapping past midnight)
//! - threshold-only: on while `lux < lightThreshold` (equality counts as
//!   light, so the boundary value turns the pin off)
//! - both: logical AND

use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};

use crate::config::Config;

/// The one pin the automation governs.
pub const AUTO_LIGHT_PIN: &str = "pin12";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    On,
    Off,
    /// Automation disabled or not evaluable for this report; leave the pin
    /// alone (a manual actor may still control it).
    NoOp,
}

pub fn decide(config: &Config, payload: &Map<String, Value>, now_minutes: u16) -> Decision {
    if !config.enable_auto_light && !config.enable_light_threshold {
        return Decision::NoOp;
    }
    let Some(lux) = payload.get("lux").and_then(Value::as_f64) else {
        return Decision::NoOp;
    };

    let within = within_schedule(
        now_minutes,
        &config.auto_light_start_time,
        &config.auto_light_end_time,
    );
    let dark = is_dark(lux, config.light_threshold);

    let on = if config.enable_auto_light && config.enable_light_threshold {
        within && dark
    } else if config.enable_auto_light {
        within
    } else {
        dark
    };

    if on {
        Decision::On
    } else {
        Decision::Off
    }
}

/// True iff `now_minutes` falls inside `[start, end)`, wrapping across
/// midnight when `start > end`. A bound that does not look like `HH:MM`
/// disables the window check (treated as always within).
pub fn within_schedule(now_minutes: u16, start: &str, end: &str) -> bool {
    let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
        return true;
    };
    if start <= end {
        now_minutes >= start && now_minutes < end
    } else {
        now_minutes >= start || now_minutes < end
    }
}

pub fn is_dark(lux: f64, threshold: f64) -> bool {
    lux < threshold
}

/// Shape check only (`DD:DD`), no range validation, matching the device
/// contract: "99:99" parses to 99h99m and simply never matches a real clock.
fn parse_hhmm(s: &str) -> Option<u16> {
    let bytes = s.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    if ![0, 1, 3, 4].iter().all(|&i| bytes[i].is_ascii_digit()) {
        return None;
    }
    let hours = u16::from((bytes[0] - b'0') * 10 + (bytes[1] - b'0'));
    let minutes = u16::from((bytes[3] - b'0') * 10 + (bytes[4] - b'0'));
    Some(hours * 60 + minutes)
}

/// Minutes since midnight in the configured fixed offset.
pub fn local_minutes(now: OffsetDateTime, tz_offset_minutes: i64) -> u16 {
    let offset = UtcOffset::from_whole_seconds((tz_offset_minutes * 60) as i32)
        .unwrap_or(UtcOffset::UTC);
    let t = now.to_offset(offset).time();
    u16::from(t.hour()) * 60 + u16::from(t.minute())
}

// ===========================================================================
// Tests
// ===========================================================================
