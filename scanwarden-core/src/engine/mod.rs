//! Adapter boundary to the external scanning daemon.
//!
//! Every method is a single bounded network call. Retrying is the
//! orchestrator's job, never the adapter's.

pub mod zap;

use async_trait::async_trait;
use scanwarden_model::{Confidence, ExternalJobRef, ScanJobId, ScanScope, Severity};
use thiserror::Error;
use url::Url;

pub use zap::{ZapEngine, ZapEngineConfig};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Network fault, timeout, or a server-side error. Worth retrying.
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// The engine understood the request and refused it.
    #[error("engine rejected request: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.is_client_error() => {
                EngineError::Rejected(err.to_string())
            }
            _ if err.is_decode() => EngineError::Rejected(err.to_string()),
            _ => EngineError::Unavailable(err.to_string()),
        }
    }
}

/// What the engine needs to register a new target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSubmission {
    pub scan_job_id: ScanJobId,
    pub target_url: Url,
    pub scope: ScanScope,
}

/// Per-phase readings; `None` when the phase has not been started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStatus {
    pub crawl_percent: Option<u8>,
    pub audit_percent: Option<u8>,
    /// Records still waiting for passive analysis.
    pub passive_backlog: Option<u64>,
}

/// An alert as reported by the engine, already mapped onto model enums.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineAlert {
    pub alert_id: String,
    pub name: String,
    pub severity: Severity,
    pub confidence: Confidence,
    pub url: String,
    pub description: String,
    pub remediation: String,
    pub parameter: Option<String>,
    pub evidence: Option<String>,
    pub cwe_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlertBatch {
    pub alerts: Vec<EngineAlert>,
    /// Cursor to pass on the next call. `None` means the engine has no
    /// incremental view and the caller must dedupe a full listing.
    pub next_cursor: Option<u64>,
    /// Another page is available right away.
    pub has_more: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScannerEngine: Send + Sync {
    /// Registers the target and returns the engine's references for it,
    /// with no task started yet.
    async fn submit_target(
        &self,
        submission: &TargetSubmission,
    ) -> Result<ExternalJobRef, EngineError>;

    /// Alerts the engine already holds for the target. A new job starts
    /// reading after these.
    async fn alert_count(&self, target_url: &Url) -> Result<u64, EngineError>;

    /// Starts the crawl and returns the crawl task reference.
    async fn start_crawl(
        &self,
        job: &ExternalJobRef,
        target_url: &Url,
        depth: u32,
        scope: ScanScope,
    ) -> Result<String, EngineError>;

    /// Starts active testing and returns the audit task reference.
    async fn start_audit(
        &self,
        job: &ExternalJobRef,
        target_url: &Url,
    ) -> Result<String, EngineError>;

    async fn status(
        &self,
        job: &ExternalJobRef,
    ) -> Result<EngineStatus, EngineError>;

    async fn alerts(
        &self,
        job: &ExternalJobRef,
        target_url: &Url,
        cursor: Option<u64>,
    ) -> Result<AlertBatch, EngineError>;

    async fn pause(&self, job: &ExternalJobRef) -> Result<(), EngineError>;

    async fn resume(&self, job: &ExternalJobRef) -> Result<(), EngineError>;

    async fn stop(&self, job: &ExternalJobRef) -> Result<(), EngineError>;
}
