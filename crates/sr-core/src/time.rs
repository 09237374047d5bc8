//! Time utilities for sybil-relay

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in milliseconds.
///
/// Returns 0 on a clock set before the Unix epoch rather than panicking;
/// timestamps here only feed logs and uptime reporting.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Time elapsed since a millisecond timestamp, or zero if it lies in the future
pub fn elapsed_since(since_millis: u64) -> Duration {
    Duration::from_millis(current_time_millis().saturating_sub(since_millis))
}
