//! Retry backoff policy

use crate::RetryPolicy;
use std::time::Duration;

/// Per-attempt step for [`RetryPolicy::Linear`].
pub const LINEAR_STEP_MS: u64 = 5_000;

/// Base delay for [`RetryPolicy::Exponential`].
pub const EXPONENTIAL_BASE_MS: u64 = 1_000;

/// Upper bound for [`RetryPolicy::Exponential`].
pub const EXPONENTIAL_CAP_MS: u64 = 60_000;

/// Constant delay for [`RetryPolicy::Fixed`].
pub const FIXED_DELAY_MS: u64 = 10_000;

/// Fallback schedule for [`RetryPolicy::Stepped`].
pub const STEPPED_SCHEDULE_MS: [u64; 3] = [1_000, 5_000, 15_000];

/// Delay used once the stepped schedule runs out.
pub const STEPPED_TAIL_MS: u64 = 15_000;

/// Milliseconds to wait before retrying.
///
/// `attempt` is the 1-based number of the attempt that just failed; 0 is
/// treated as 1.
pub fn delay_ms(attempt: u32, policy: RetryPolicy) -> u64 {
    let attempt = attempt.max(1);
    match policy {
        RetryPolicy::Linear => u64::from(attempt).saturating_mul(LINEAR_STEP_MS),
        RetryPolicy::Exponential => {
            let exponent = attempt - 1;
            // 2^6 * 1000 already exceeds the cap
            if exponent >= 6 {
                EXPONENTIAL_CAP_MS
            } else {
                (EXPONENTIAL_BASE_MS << exponent).min(EXPONENTIAL_CAP_MS)
            }
        }
        RetryPolicy::Fixed => FIXED_DELAY_MS,
        RetryPolicy::Stepped => STEPPED_SCHEDULE_MS
            .get(attempt as usize - 1)
            .copied()
            .unwrap_or(STEPPED_TAIL_MS),
    }
}

/// [`delay_ms`] as a [`Duration`].
pub fn delay(attempt: u32, policy: RetryPolicy) -> Duration {
    Duration::from_millis(delay_ms(attempt, policy))
}
