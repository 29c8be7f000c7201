use std::time::Duration;

use rand::Rng;

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);
const DEFAULT_JITTER: f64 = 0.2;

/// Per-artifact backoff: `initial * 2^(attempt - 1)` capped at `max`, minus
/// up to `jitter` of the delay. Attempts are unlimited.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            jitter: DEFAULT_JITTER,
        }
    }

    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    #[must_use]
    pub const fn initial(&self) -> Duration {
        self.initial
    }

    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }

    /// Un-jittered delay after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Delay before retrying after the `attempt`-th failure.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let fraction = rand::thread_rng().gen_range(0.0..=self.jitter);
        base.saturating_sub(base.mul_f64(fraction))
    }
}
