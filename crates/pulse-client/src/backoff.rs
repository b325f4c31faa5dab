use std::time::Duration;

pub const BASE_DELAY_MS: u64 = 1_000;
pub const MAX_DELAY_MS: u64 = 30_000;

/// Delay before reconnect attempt number `attempts` (zero-based):
/// `min(base * 2^attempts, max)`.
pub fn backoff_delay(attempts: u32) -> Duration {
    let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    Duration::from_millis(BASE_DELAY_MS.saturating_mul(factor).min(MAX_DELAY_MS))
}
