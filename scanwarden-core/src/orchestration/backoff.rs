use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use scanwarden_model::ScanJobId;

use super::config::RetryConfig;

/// Exponential backoff with jitter that is deterministic per (job, attempt),
/// so replays and tests see the same schedule.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u16 {
        self.config.max_attempts
    }

    /// True once `failures` consecutive faults have used up the budget.
    pub fn exhausted(&self, failures: u16) -> bool {
        failures >= self.config.max_attempts
    }

    pub fn delay_for(&self, job_id: ScanJobId, attempt: u16) -> Duration {
        let anchor = self.base_delay_ms(attempt);
        Duration::from_millis(self.jittered_delay_for_anchor(anchor, job_id, attempt))
    }

    fn base_delay_ms(&self, attempt: u16) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = (attempt.saturating_sub(1)) as i32;
        let scaled = (self.config.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.config.backoff_max_ms as f64);
        capped.max(0.0) as u64
    }

    fn jittered_delay_for_anchor(
        &self,
        anchor_ms: u64,
        job_id: ScanJobId,
        attempt: u16,
    ) -> u64 {
        if anchor_ms == 0 {
            return 0;
        }

        let jitter_ratio = f64::from(self.config.jitter_ratio.max(0.0));
        let jitter_span = ((anchor_ms as f64) * jitter_ratio)
            .max(self.config.jitter_min_ms as f64)
            .min(self.config.backoff_max_ms as f64);

        let lower = 0f64.max(anchor_ms as f64 - jitter_span);
        let upper =
            (anchor_ms as f64 + jitter_span).min(self.config.backoff_max_ms as f64);
        if upper <= lower {
            return lower.round() as u64;
        }

        let unit = deterministic_unit(job_id, attempt);
        let jittered = lower + (upper - lower) * unit;
        jittered.round() as u64
    }
}

fn deterministic_unit(job_id: ScanJobId, attempt: u16) -> f64 {
    let mut hasher = DefaultHasher::default();
    job_id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    let bits = hasher.finish();
    (bits as f64) / (u64::MAX as f64)
}
