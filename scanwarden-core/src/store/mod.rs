//! Durable record of scan jobs and their findings.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scanwarden_model::{Finding, ScanJob, ScanJobId, ScanState, Severity, SeverityCounts};
use thiserror::Error;

pub use memory::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("scan job {0} does not exist")]
    NotFound(ScanJobId),

    #[error("conflicting record: {0}")]
    Conflict(String),

    #[error("stored record is malformed: {0}")]
    Corrupt(String),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "postgres")]
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Which jobs a listing should include.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    /// `None` lists every state.
    pub states: Option<Vec<ScanState>>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn terminal() -> Self {
        Self {
            states: Some(
                ScanState::ALL
                    .into_iter()
                    .filter(|state| state.is_terminal())
                    .collect(),
            ),
        }
    }

    pub fn non_terminal() -> Self {
        Self {
            states: Some(
                ScanState::ALL
                    .into_iter()
                    .filter(|state| !state.is_terminal())
                    .collect(),
            ),
        }
    }

    pub fn matches(&self, state: ScanState) -> bool {
        self.states
            .as_ref()
            .is_none_or(|states| states.contains(&state))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindingQuery {
    pub scan_job_id: Option<ScanJobId>,
    pub severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl FindingQuery {
    pub fn for_job(scan_job_id: ScanJobId) -> Self {
        Self {
            scan_job_id: Some(scan_job_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, finding: &Finding) -> bool {
        self.scan_job_id.is_none_or(|id| finding.scan_job_id == id)
            && self.severity.is_none_or(|sev| finding.severity == sev)
            && self.since.is_none_or(|since| finding.discovered_at >= since)
            && self.until.is_none_or(|until| finding.discovered_at <= until)
    }
}

/// Every call is atomic on its own; callers never see a half-applied write.
///
/// Jobs list in creation order. Findings list newest first.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &ScanJob) -> Result<(), StoreError>;

    async fn update_job(&self, job: &ScanJob) -> Result<(), StoreError>;

    /// Inserts findings whose ids are not yet stored and returns how many
    /// were new.
    async fn append_findings(
        &self,
        findings: &[Finding],
    ) -> Result<usize, StoreError>;

    async fn get_job(&self, id: ScanJobId) -> Result<Option<ScanJob>, StoreError>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScanJob>, StoreError>;

    async fn list_findings(
        &self,
        query: &FindingQuery,
    ) -> Result<Vec<Finding>, StoreError>;

    async fn severity_counts(
        &self,
        scan_job_id: Option<ScanJobId>,
    ) -> Result<SeverityCounts, StoreError>;
}
