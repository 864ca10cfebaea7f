use chrono::Duration;

const BACKOFF_UNIT_SECS: i64 = 60;
const BACKOFF_FACTOR: i64 = 2;

/// Exponential backoff and the failure ceiling for one monitored source.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_delay: Duration,
    max_consecutive_failures: u32,
}

impl RetryPolicy {
    pub fn new(max_delay: Duration, max_consecutive_failures: u32) -> Self {
        Self {
            max_delay,
            max_consecutive_failures,
        }
    }

    /// `2^failures` minutes, capped at the policy maximum.
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let factor = BACKOFF_FACTOR.saturating_pow(consecutive_failures);
        let delay_secs = BACKOFF_UNIT_SECS.saturating_mul(factor);
        let max_secs = self.max_delay.num_seconds();

        Duration::seconds(delay_secs.min(max_secs))
    }

    /// True once the failure count reaches the ceiling.
    pub fn is_exhausted(&self, consecutive_failures: u32) -> bool {
        consecutive_failures >= self.max_consecutive_failures
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::hours(1), 5)
    }
}
