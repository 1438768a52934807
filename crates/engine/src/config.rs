//! Transfer tuning knobs.

use std::time::Duration;

use coldvault_transfer::{
    DEFAULT_PART_SIZE, DEFAULT_RANGE_SIZE, validate_concurrency, validate_part_size,
};

use crate::error::VaultError;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculates the delay before retry number `attempt` (1-based),
    /// with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / 1_000_000_000.0)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        Duration::from_secs_f64((capped + jitter * offset).max(0.0))
    }
}

/// Retrieval job polling.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Wait between status queries while the job runs.
    pub interval: Duration,
    /// Backoff for failed status queries. `max_attempts` consecutive
    /// failures end the wait.
    pub retry: RetryPolicy,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            retry: RetryPolicy {
                max_attempts: 10,
                initial_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(600),
                backoff_factor: 2.0,
            },
        }
    }
}

/// Configuration shared by uploads and downloads.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    /// Preferred upload part size; enlarged automatically for huge files.
    pub part_size: u64,
    /// Download range size.
    pub range_size: u64,
    /// Workers per operation.
    pub concurrency: usize,
    /// Timeout applied to each individual service call.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub poll: PollConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            range_size: DEFAULT_RANGE_SIZE,
            concurrency: 10,
            call_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            poll: PollConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Rejects settings no operation could run with.
    pub fn validate(&self) -> Result<(), VaultError> {
        validate_part_size(self.part_size)?;
        validate_part_size(self.range_size)?;
        validate_concurrency(self.concurrency)?;
        if self.retry.max_attempts == 0 {
            return Err(VaultError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.poll.retry.max_attempts == 0 {
            return Err(VaultError::Config(
                "poll.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(VaultError::Config("call_timeout must be positive".into()));
        }
        if self.poll.interval.is_zero() {
            return Err(VaultError::Config("poll.interval must be positive".into()));
        }
        Ok(())
    }
}
