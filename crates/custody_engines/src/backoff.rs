#![forbid(unsafe_code)]

use rand::Rng;

use custody_contracts::delivery::BackoffConfig;
use custody_contracts::MonotonicTimeNs;

/// Delay before the next attempt, given the number of attempts already
/// made: `min(base * 2^attempts, max)` plus a jitter slice of the
/// capped delay. With `jitter_fraction < 1` the jittered delay for
/// attempt n+1 always exceeds attempt n's until the cap is reached.
pub fn next_retry_delay_ms<R: Rng>(
    policy: &BackoffConfig,
    attempt_count: u16,
    rng: &mut R,
) -> u64 {
    let shift = u32::from(attempt_count.min(63));
    let exponential = policy
        .base_delay_ms
        .saturating_mul(1u64.checked_shl(shift).unwrap_or(u64::MAX));
    let capped = exponential.min(policy.max_delay_ms);
    let jitter = (capped as f64 * f64::from(policy.jitter_fraction) * rng.gen::<f64>()) as u64;
    capped.saturating_add(jitter)
}

/// Absolute retry time for a task that has now failed its
/// `attempt_count`-th attempt.
pub fn next_retry_at<R: Rng>(
    policy: &BackoffConfig,
    now: MonotonicTimeNs,
    attempt_count: u16,
    rng: &mut R,
) -> MonotonicTimeNs {
    now.saturating_add_ms(next_retry_delay_ms(policy, attempt_count, rng))
}
