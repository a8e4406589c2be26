//! Jittered exponential backoff for failed jobs and outbox redeliveries.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Exponent ceiling; 2^20 seconds is far past any sane delay cap.
const MAX_EXPONENT: u32 = 20;

/// Retry policy computing the next availability of a failed job.
///
/// The delay doubles per attempt, saturates at `cap`, and gains additive
/// uniform jitter so retries never fall below the exponential lower bound
/// but herds of simultaneous failures spread out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Ceiling on the un-jittered delay.
    pub cap: Duration,
    /// Fraction of the bounded delay added as jitter, e.g. `0.1` for up
    /// to +10%.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Computes the delay before attempt `attempts + 1`, where `attempts`
    /// is the post-increment failure count (so the first failure passes 1).
    pub fn delay(&self, attempts: i32, rng: &mut impl Rng) -> Duration {
        let exponent = u32::try_from(attempts.saturating_sub(1))
            .unwrap_or(0)
            .min(MAX_EXPONENT);
        let raw = self.base.saturating_mul(2u32.saturating_pow(exponent));
        let bound = raw.min(self.cap);

        if self.jitter_ratio <= 0.0 {
            return bound;
        }
        let jitter = bound.mul_f64(rng.gen_range(0.0..self.jitter_ratio));
        bound + jitter
    }

    /// Computes the instant a job failed `attempts` times becomes claimable
    /// again.
    pub fn next_available_at(
        &self,
        now: DateTime<Utc>,
        attempts: i32,
        rng: &mut impl Rng,
    ) -> DateTime<Utc> {
        let delay = self.delay(attempts, rng);
        now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            jitter_ratio: 0.0,
        };
        let mut rng = rng();
        assert_eq!(policy.delay(1, &mut rng), Duration::from_secs(1));
        assert_eq!(policy.delay(2, &mut rng), Duration::from_secs(2));
        assert_eq!(policy.delay(3, &mut rng), Duration::from_secs(4));
        assert_eq!(policy.delay(4, &mut rng), Duration::from_secs(8));
    }

    #[test]
    fn delay_saturates_at_cap() {
        let policy = RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter_ratio: 0.0,
        };
        let mut rng = rng();
        assert_eq!(policy.delay(7, &mut rng), Duration::from_secs(60));
        // Huge attempt counts must not overflow.
        assert_eq!(policy.delay(i32::MAX, &mut rng), Duration::from_secs(60));
    }

    #[test]
    fn jitter_is_additive_and_bounded() {
        let policy = RetryPolicy {
            base: Duration::from_secs(10),
            cap: Duration::from_secs(300),
            jitter_ratio: 0.1,
        };
        let mut rng = rng();
        for _ in 0..1000 {
            let delay = policy.delay(1, &mut rng);
            assert!(delay >= Duration::from_secs(10));
            assert!(delay < Duration::from_secs(11));
        }
    }

    #[test]
    fn same_seed_same_schedule() {
        let policy = RetryPolicy::default();
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for attempts in 1..10 {
            assert_eq!(policy.delay(attempts, &mut a), policy.delay(attempts, &mut b));
        }
    }

    #[test]
    fn zero_and_negative_attempts_use_base() {
        let policy = RetryPolicy {
            base: Duration::from_secs(3),
            cap: Duration::from_secs(300),
            jitter_ratio: 0.0,
        };
        let mut rng = rng();
        assert_eq!(policy.delay(0, &mut rng), Duration::from_secs(3));
        assert_eq!(policy.delay(-5, &mut rng), Duration::from_secs(3));
    }
}
