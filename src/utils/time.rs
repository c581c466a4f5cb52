//! Miniserver time helpers.
//!
//! The Miniserver counts seconds from 2009-01-01 00:00:00 UTC instead of the unix epoch.

use crate::error::{constants, ProtocolError, Result};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unix timestamp of 2009-01-01 00:00:00 UTC
pub const MINISERVER_EPOCH_UNIX_SECS: u64 = 1_230_768_000;

/// Start of the Miniserver epoch as a `SystemTime`
pub fn miniserver_epoch() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(MINISERVER_EPOCH_UNIX_SECS)
}

/// Convert seconds since the Miniserver epoch to a `SystemTime`
pub fn from_miniserver_seconds(seconds: u64) -> SystemTime {
    miniserver_epoch() + Duration::from_secs(seconds)
}

/// Milliseconds since the unix epoch
pub fn current_timestamp_millis() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.into()))
}

/// Time left until `valid_until` (seconds since the Miniserver epoch) as seen from `now`.
///
/// Returns `None` once the instant has passed.
pub fn remaining_until(valid_until: u64, now: SystemTime) -> Option<Duration> {
    from_miniserver_seconds(valid_until).duration_since(now).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_offset() {
        let epoch = miniserver_epoch();
        let secs = epoch.duration_since(UNIX_EPOCH).unwrap().as_secs();
        // 39 years incl. 10 leap days
        assert_eq!(secs, (39 * 365 + 10) * 86_400);
    }

    #[test]
    fn test_remaining_until() {
        let now = from_miniserver_seconds(1_000);
        assert_eq!(
            remaining_until(1_100, now),
            Some(Duration::from_secs(100))
        );
        assert_eq!(remaining_until(900, now), None);
    }

    #[test]
    fn test_current_timestamp() {
        let now = current_timestamp_millis().unwrap();
        assert!(now > MINISERVER_EPOCH_UNIX_SECS * 1000);
    }
}
