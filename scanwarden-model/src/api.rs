//! Request and response bodies for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::finding::SeverityCounts;
use crate::ids::ScanJobId;
use crate::scan::{PhaseProgress, ScanJob, ScanScope, ScanState, ScanType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn error(error: String) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(error),
            message: None,
        }
    }

    pub fn with_message(mut self, message: String) -> Self {
        self.message = Some(message);
        self
    }
}

/// Body of `POST /scans`. Omitted settings fall back to orchestrator defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StartScanRequest {
    pub name: String,
    pub target_url: String,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub scope: Option<ScanScope>,
    #[serde(default)]
    pub scan_types: Option<Vec<ScanType>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProgressView {
    pub scan_id: ScanJobId,
    pub state: ScanState,
    pub progress_percent: u8,
    pub phase_progress: PhaseProgress,
    pub findings_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<&ScanJob> for ScanProgressView {
    fn from(job: &ScanJob) -> Self {
        Self {
            scan_id: job.id,
            state: job.state,
            progress_percent: job.progress_percent,
            phase_progress: job.phase_progress,
            findings_count: job.findings_count,
            updated_at: job.updated_at,
        }
    }
}

/// A finished job together with its result summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedScan {
    #[serde(flatten)]
    pub job: ScanJob,
    pub severity_counts: SeverityCounts,
    pub total_findings: u64,
    pub duration_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStats {
    pub total_scans: u64,
    pub active_scans: u64,
    pub queued_scans: u64,
    pub total_findings: u64,
    pub severity_counts: SeverityCounts,
    /// Scans started within the last 24 hours.
    pub recent_scans: u64,
}
