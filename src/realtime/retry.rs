//! Reconnection backoff policy.
//!
//! Pure and stateless so delay sequences can be asserted exactly. This is
//! the single authority for reconnect timing: the connection manager asks
//! for a delay per attempt and translates the `None` sentinel into the
//! suspended state.

use std::time::Duration;

/// Delay before the first retry.
pub const INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Multiplier applied per attempt.
pub const BACKOFF_FACTOR: u32 = 2;

/// Ceiling for any single delay.
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// Consecutive failed attempts tolerated before giving up.
pub const MAX_ATTEMPTS: u32 = 8;

/// Backoff delay for the given attempt number, or `None` once the attempt
/// count has reached [`MAX_ATTEMPTS`] and the caller should stop retrying.
pub fn delay(attempt: u32) -> Option<Duration> {
    if attempt >= MAX_ATTEMPTS {
        return None;
    }
    let factor = BACKOFF_FACTOR.saturating_pow(attempt);
    Some(INITIAL_DELAY.saturating_mul(factor).min(MAX_DELAY))
}
