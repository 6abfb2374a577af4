//! Common helper functions for Smart Fidget.

use chrono::{Local, NaiveDateTime};
use fidget_core::command::CLOCK_FORMAT;

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

pub fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Local wall-clock time in the format the device's `T:` command expects.
pub fn device_clock_stamp() -> String {
    clock_stamp(&Local::now().naive_local())
}

pub fn clock_stamp(time: &NaiveDateTime) -> String {
    time.format(CLOCK_FORMAT).to_string()
}
