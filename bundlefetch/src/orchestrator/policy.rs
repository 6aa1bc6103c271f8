//! Retry policy for chunk transfers.
//!
//! Failed chunks are retried with exponential backoff:
//! `base_delay * 2^(n-1)` after the n-th failure, capped at `max_delay`.
//! Once a chunk has failed `max_retries` times (at least once) in the current
//! retry round it is terminal and its task fails.

use std::time::Duration;

/// Default number of failures tolerated per chunk.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay after the first failure (5 seconds).
pub const DEFAULT_BASE_DELAY_SECS: u64 = 5;

/// Default backoff cap (60 seconds).
pub const DEFAULT_MAX_DELAY_SECS: u64 = 60;

/// How chunk transfer failures are retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures tolerated per chunk and retry round.
    pub max_retries: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(DEFAULT_BASE_DELAY_SECS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given limits.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Policy that fails a chunk on its first error.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Failures a chunk may accumulate in one retry round before it is
    /// terminal. Never zero: a round always includes at least one attempt.
    pub fn attempts_per_round(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay after the `failures`-th failure of a round: `base * 2^(failures-1)`,
    /// at most `max_delay`.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        // Saturate well before the shift overflows
        let exponent = (failures - 1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
