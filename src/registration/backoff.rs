//! Full-jitter exponential backoff for the heartbeat retry schedule.
//!
//! `delay = random_uniform(0, min(ceiling, base * 2^attempt))`, the same
//! shape as a connection-retry backoff, but driven by a proper uniform
//! distribution (`rand::thread_rng()`) rather than a time-seeded one,
//! since the mean-delay property is tested over thousands of trials.

use std::time::Duration;

use rand::Rng;

pub const BASE_DELAY_MS: u64 = 5_000;

/// Computes the backoff delay for `attempt` (0-indexed), capped at
/// `ceiling_ms`.
pub fn backoff_with_jitter(attempt: u32, ceiling_ms: u64) -> Duration {
    let exp_ms = BASE_DELAY_MS.saturating_mul(2u64.saturating_pow(attempt));
    let capped_ms = exp_ms.min(ceiling_ms);
    let jitter_ms = if capped_ms > 0 {
        rand::thread_rng().gen_range(0..=capped_ms)
    } else {
        0
    };
    Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_the_capped_bound() {
        let ceiling = 300_000;
        for attempt in 0..12 {
            let capped = BASE_DELAY_MS.saturating_mul(2u64.saturating_pow(attempt)).min(ceiling);
            for _ in 0..100 {
                let delay = backoff_with_jitter(attempt, ceiling);
                assert!(delay.as_millis() as u64 <= capped);
            }
        }
    }

    #[test]
    fn mean_delay_is_within_tolerance_of_half_the_cap() {
        let ceiling = 300_000;
        let attempt = 3;
        let capped = BASE_DELAY_MS.saturating_mul(2u64.saturating_pow(attempt)).min(ceiling) as f64;
        let trials = 10_000;
        let sum: f64 = (0..trials).map(|_| backoff_with_jitter(attempt, ceiling).as_millis() as f64).sum();
        let mean = sum / trials as f64;
        let expected = capped / 2.0;
        assert!(
            (mean - expected).abs() <= expected * 0.1,
            "mean {mean} not within 10% of expected {expected}"
        );
    }
}
