//! Per-query timing and retry options.

use std::time::Duration;

use crate::config::CacheConfig;

/// Options for one query. Defaults mirror [`CacheConfig::default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Age below which cached data is served without fetching.
    pub stale_time: Duration,
    /// Delay between the last unsubscribe and removal of the entry.
    pub cache_time: Duration,
    /// Retries after the first failed attempt.
    pub retry: u32,
    /// Base delay; attempt `n` waits `retry_delay * 2^n`.
    pub retry_delay: Duration,
}

impl QueryOptions {
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Delay before retrying after failed attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl From<&CacheConfig> for QueryOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            stale_time: Duration::from_millis(config.stale_time_ms),
            cache_time: Duration::from_millis(config.cache_time_ms),
            retry: config.retry,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}
