//! Retry policy for activity attempts

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential-backoff retry configuration for activities
///
/// An activity is attempted at most `retry_count + 1` times. After a failed
/// attempt `n` (1-based), the next attempt is delayed by
/// `backoff_base * backoff_coefficient^(n-1)`, capped at `backoff_cap`.
///
/// # Example
///
/// ```
/// use loom_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
///
/// // First retry after 1 second, then 2s, 4s, ... capped at 5 minutes
/// assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt
    pub retry_count: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub backoff_base: Duration,

    /// Upper bound on any single delay
    #[serde(with = "duration_millis")]
    pub backoff_cap: Duration,

    /// Backoff multiplier between consecutive retries
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) added to each delay
    ///
    /// Zero by default so delays follow the configured curve exactly.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
            backoff_coefficient: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given retry count and default backoff curve
    pub fn with_retries(retry_count: u32) -> Self {
        Self {
            retry_count,
            ..Default::default()
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            retry_count: 0,
            ..Default::default()
        }
    }

    /// Set the base delay
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Set the delay cap
    pub fn with_backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap = cap;
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Total attempts this policy allows
    pub fn max_attempts(&self) -> u32 {
        self.retry_count + 1
    }

    /// Whether another attempt remains after `attempt` (1-based) failed
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Delay to wait after failed attempt `attempt` (1-based)
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.backoff_base.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.backoff_cap.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.jitter;
            let offset = rng.gen_range(-range..range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
