//! Backoff helpers for retry scheduling

use std::time::Duration;

/// Base delay for the first retry
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on any computed delay
pub const MAX_DELAY: Duration = Duration::from_secs(30);

/// Pure exponential backoff: `min(cap, base * 2^(attempt - 1))`.
///
/// Attempt numbers start at 1. Same input, same output; jitter is the
/// retry driver's concern, not the formula's.
pub fn exponential_delay(attempt: u32) -> Duration {
    exponential_delay_with(attempt, BASE_DELAY, MAX_DELAY)
}

pub fn exponential_delay_with(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exponent);
    delay.min(cap)
}

/// Add up to `max_jitter` (fraction of the delay) of random jitter.
/// Used by the retry driver to avoid synchronized retries.
pub fn with_jitter(delay: Duration, max_jitter: f64) -> Duration {
    use rand::Rng;
    let jitter_factor = rand::thread_rng().gen_range(0.0..=max_jitter.max(0.0));
    let extra = delay.as_millis() as f64 * jitter_factor;
    delay + Duration::from_millis(extra as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_per_attempt() {
        assert_eq!(exponential_delay(1), Duration::from_secs(1));
        assert_eq!(exponential_delay(2), Duration::from_secs(2));
        assert_eq!(exponential_delay(3), Duration::from_secs(4));
        assert_eq!(exponential_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn delays_cap_at_thirty_seconds() {
        assert_eq!(exponential_delay(6), Duration::from_secs(30));
        assert_eq!(exponential_delay(60), Duration::from_secs(30));
    }

    #[test]
    fn formula_is_pure() {
        for attempt in 1..10 {
            assert_eq!(exponential_delay(attempt), exponential_delay(attempt));
        }
    }

    #[test]
    fn jitter_stays_within_bound() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let jittered = with_jitter(base, 0.2);
            assert!(jittered >= base);
            assert!(jittered <= base + Duration::from_millis(200));
        }
    }
}
