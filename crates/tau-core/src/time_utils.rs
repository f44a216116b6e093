use std::time::Duration;

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns true once `expires_unix_ms` is no longer in the future.
pub fn is_expired_unix_ms(expires_unix_ms: u64, now_unix_ms: u64) -> bool {
    expires_unix_ms <= now_unix_ms
}

/// Adds `duration` to a unix-ms timestamp, saturating at `u64::MAX`.
pub fn unix_ms_after(now_unix_ms: u64, duration: Duration) -> u64 {
    let delta = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    now_unix_ms.saturating_add(delta)
}
