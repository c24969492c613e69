//! Exponential backoff for retried operations.
//!
//! Backoff formula: min(max_delay, base_delay * 2^attempt) + jitter

use std::time::Duration;

/// Configuration for exponential backoff retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Base delay for first retry (default: 100ms)
    pub base_delay: Duration,
    /// Maximum delay cap (default: 10s)
    pub max_delay: Duration,
    /// Maximum number of retries (default: 5)
    pub max_retries: u32,
    /// Whether to add jitter (randomness) to delays (default: true)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_retries: 5,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
            jitter: true,
        }
    }

    /// Disable jitter (for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Calculate the backoff delay for a given attempt.
    ///
    /// Jitter is ±25% of the capped delay.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_delay_ms = delay_ms.min(max_ms);

        let final_delay_ms = if self.jitter && capped_delay_ms >= 4 {
            let jitter_range = capped_delay_ms / 4;
            let jitter = (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos() as u64)
                % (jitter_range * 2 + 1);
            capped_delay_ms.saturating_sub(jitter_range) + jitter
        } else {
            capped_delay_ms
        };

        Duration::from_millis(final_delay_ms)
    }
}
