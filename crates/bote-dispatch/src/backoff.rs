//! Exponential backoff policy for failed dispatch cycles.
//!
//! When an event exhausts its inline publish attempts, the dispatcher parks
//! it with a `next_attempt_at` computed from this policy. The delay doubles
//! with each failed cycle up to a hard ceiling, keeping retry pressure on a
//! flaky bus bounded while unhealthy events wait their turn.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff policy for scheduling dispatch retries.
///
/// The delay for a row with `attempts` failed cycles is
/// `min(max_delay, base_delay * 2^min(attempts, exponent_cap))`. There is no
/// jitter: the schedule is deterministic so operators can predict when a
/// parked event becomes due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay for the exponential calculation.
    pub base_delay: Duration,

    /// Maximum delay between dispatch cycles.
    pub max_delay: Duration,

    /// Cap on the exponent to keep the doubling from overflowing.
    pub exponent_cap: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            exponent_cap: 10,
        }
    }
}

impl BackoffPolicy {
    /// Computes the backoff delay for an event with the given attempts count.
    ///
    /// `attempts` is the count being recorded for the failed cycle, so the
    /// first failure (attempts = 1) already doubles the base delay.
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let exponent = u32::try_from(attempts.max(0)).unwrap_or(0).min(self.exponent_cap);
        let multiplier = 2_u32.saturating_pow(exponent);

        std::cmp::min(self.base_delay.saturating_mul(multiplier), self.max_delay)
    }
}
