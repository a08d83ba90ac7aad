//! Read-side summaries built from the job store.

use chrono::{Duration, Utc};
use scanwarden_model::api::{CompletedScan, ScanStats};

use crate::error::Result;
use crate::store::{JobFilter, JobStore};

const RECENT_WINDOW_HOURS: i64 = 24;

#[derive(Clone, Copy)]
pub struct ScanQueries<'a> {
    store: &'a dyn JobStore,
}

impl std::fmt::Debug for ScanQueries<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanQueries").finish_non_exhaustive()
    }
}

impl<'a> ScanQueries<'a> {
    pub fn new(store: &'a dyn JobStore) -> Self {
        Self { store }
    }

    /// Dashboard totals. Active and queued counts come from the live
    /// admission state since stored rows may lag a poll behind.
    pub async fn stats(&self, active: u64, queued: u64) -> Result<ScanStats> {
        let jobs = self.store.list_jobs(&JobFilter::all()).await?;
        let severity_counts = self.store.severity_counts(None).await?;
        let since = Utc::now() - Duration::hours(RECENT_WINDOW_HOURS);

        Ok(ScanStats {
            total_scans: jobs.len() as u64,
            active_scans: active,
            queued_scans: queued,
            total_findings: severity_counts.total(),
            severity_counts,
            recent_scans: jobs.iter().filter(|job| job.started_at >= since).count() as u64,
        })
    }

    /// Terminal jobs, most recently finished first.
    pub async fn completed(&self, limit: Option<usize>) -> Result<Vec<CompletedScan>> {
        let mut jobs = self.store.list_jobs(&JobFilter::terminal()).await?;
        jobs.sort_by(|a, b| b.completed_at.cmp(&a.completed_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = limit {
            jobs.truncate(limit);
        }

        let mut completed = Vec::with_capacity(jobs.len());
        for job in jobs {
            let severity_counts = self.store.severity_counts(Some(job.id)).await?;
            completed.push(CompletedScan {
                total_findings: severity_counts.total(),
                duration_secs: job.duration_secs(),
                severity_counts,
                job,
            });
        }
        Ok(completed)
    }
}
