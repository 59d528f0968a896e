// Retry decisions for failed jobs
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do with a job that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PenaltyInfo {
    pub try_again: bool,
    /// `None` re-queues immediately.
    pub delay: Option<Duration>,
}

impl PenaltyInfo {
    pub fn retry_after(delay: Duration) -> Self {
        Self {
            try_again: true,
            delay: Some(delay),
        }
    }

    pub fn retry_now() -> Self {
        Self {
            try_again: true,
            delay: None,
        }
    }

    pub fn give_up() -> Self {
        Self {
            try_again: false,
            delay: None,
        }
    }
}

/// Linear backoff: the n-th failure waits `n * base_delay`, capped at
/// `max_delay`, until `max_attempts` failures have accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            base_delay_ms: 300,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn penalty(&self, failed_count: u32) -> PenaltyInfo {
        if failed_count >= self.max_attempts {
            return PenaltyInfo::give_up();
        }
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(u64::from(failed_count))
            .min(self.max_delay_ms);
        PenaltyInfo::retry_after(Duration::from_millis(delay_ms))
    }
}
