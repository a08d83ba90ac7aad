use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so deployments can supply a partial
/// configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Delay between consecutive polls of one job.
    pub poll_interval_ms: u64,
    /// Jobs allowed in crawling, auditing, paused, or stopping at once.
    pub max_active_scans: usize,
    /// Retry/backoff policy for engine and store faults.
    pub retry: RetryConfig,
    /// Upper bound on the engine stop handshake before the job is
    /// finalized anyway.
    pub stop_timeout_ms: u64,
    /// Refuse a start while another non-terminal job has the same target.
    pub reject_duplicate_targets: bool,
    /// Alert pages pulled per poll before yielding to the next tick.
    pub max_alert_pages_per_poll: u32,
    /// Crawl depth used when a request does not name one.
    pub default_depth: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            max_active_scans: 1,
            retry: RetryConfig::default(),
            stop_timeout_ms: 15_000,
            reject_duplicate_targets: false,
            max_alert_pages_per_poll: 20,
            default_depth: 5,
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(ScanError::InvalidConfig(
                "poll_interval_ms must be greater than zero".into(),
            ));
        }
        if self.max_active_scans == 0 {
            return Err(ScanError::InvalidConfig(
                "max_active_scans must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ScanError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return Err(ScanError::InvalidConfig(
                "retry.backoff_base_ms exceeds retry.backoff_max_ms".into(),
            ));
        }
        if self.default_depth == 0 {
            return Err(ScanError::InvalidConfig(
                "default_depth must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive failed attempts before the job is marked failed.
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds so short delays still spread a bit.
    pub jitter_min_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 250,
        }
    }
}
