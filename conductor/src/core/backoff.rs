//! Exponential backoff arithmetic.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `retry_index` (0-based): `base * 2^retry_index`.
///
/// Saturates at [`Duration::MAX`] instead of overflowing.
pub fn delay_for(base: Duration, retry_index: u32) -> Duration {
    2u32.checked_pow(retry_index)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}

/// Total un-jittered sleep across `retries` retries: `base * (2^retries - 1)`.
pub fn total_delay(base: Duration, retries: u32) -> Duration {
    (0..retries).fold(Duration::ZERO, |acc, idx| {
        acc.saturating_add(delay_for(base, idx))
    })
}

/// Stretch `delay` by a random factor in `[1, 1 + jitter]`.
pub fn with_jitter<R: Rng + ?Sized>(delay: Duration, jitter: f64, rng: &mut R) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = 1.0 + rng.gen_range(0.0..=jitter);
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}
