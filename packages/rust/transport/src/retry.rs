//! Retry timing for the knowledge-base transport.

use std::time::Duration;

use refkb_shared::TransportConfig;

/// Bounded retry policy for 429 and 5xx responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Ceiling for server-error backoff.
    pub max_backoff: Duration,
    /// Delay used for a 429 without a usable `Retry-After` header.
    pub default_retry_after: Duration,
    /// Base of the exponential backoff (`unit * 2^attempt`).
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_backoff: Duration::from_secs(30),
            default_retry_after: Duration::from_secs(60),
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl From<&TransportConfig> for RetryPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            max_backoff: config.max_backoff,
            default_retry_after: config.default_retry_after,
            ..Self::default()
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying a 5xx: `min(unit * 2^attempt, max_backoff)`.
    pub fn server_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_unit
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Delay before retrying a 429, from the `Retry-After` header in seconds.
    pub fn rate_limit_delay(&self, retry_after: Option<&str>) -> Duration {
        retry_after
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.default_retry_after)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
