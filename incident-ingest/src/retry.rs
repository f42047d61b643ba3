use std::time;

/// Exponential backoff for transient failures against the primary store and
/// the broker. Gives up after `max_attempts` so a permanently broken
/// dependency surfaces as an error instead of a silent stall.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// Total attempts, including the first one.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
        max_attempts: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Time to wait after the `attempt`th failure (1-based).
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self
            .backoff_coefficient
            .checked_pow(exponent)
            .unwrap_or(u32::MAX);
        let candidate_interval = self
            .initial_interval
            .checked_mul(multiplier)
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(200),
            maximum_interval: Some(time::Duration::from_secs(10)),
            max_attempts: 5,
        }
    }
}
