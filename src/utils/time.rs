//! Timestamp and jitter helpers.

use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{constants, ProtocolError, Result};

/// Seconds since the Unix epoch
pub fn unix_seconds() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.into()))
}

/// Milliseconds since the Unix epoch
pub fn unix_millis() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.into()))
}

/// Wall-clock instant for a millisecond epoch timestamp
pub fn from_unix_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// Uniformly random duration in `[min, max]`.
///
/// Returns `min` when the range is empty.
pub fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
}

/// Uniformly random duration in `[0, ceiling]`
pub fn jitter_up_to(ceiling: Duration) -> Duration {
    jitter(Duration::ZERO, ceiling)
}
