use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::ModelError;
use crate::ids::ScanJobId;

/// Lifecycle state of a scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ScanState {
    Queued,
    Crawling,
    Auditing,
    Paused,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl ScanState {
    pub const ALL: [ScanState; 8] = [
        ScanState::Queued,
        ScanState::Crawling,
        ScanState::Auditing,
        ScanState::Paused,
        ScanState::Stopping,
        ScanState::Stopped,
        ScanState::Completed,
        ScanState::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::Stopped | ScanState::Completed | ScanState::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanState::Queued => "queued",
            ScanState::Crawling => "crawling",
            ScanState::Auditing => "auditing",
            ScanState::Paused => "paused",
            ScanState::Stopping => "stopping",
            ScanState::Stopped => "stopped",
            ScanState::Completed => "completed",
            ScanState::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScanState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ModelError::UnknownVariant {
                kind: "scan state",
                value: s.to_string(),
            })
    }
}

/// Sequential engine phase a running job is in (or returns to after pause).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ScanPhase {
    Crawl,
    Audit,
}

impl ScanPhase {
    pub fn state(self) -> ScanState {
        match self {
            ScanPhase::Crawl => ScanState::Crawling,
            ScanPhase::Audit => ScanState::Auditing,
        }
    }

    pub fn of_state(state: ScanState) -> Option<Self> {
        match state {
            ScanState::Crawling => Some(ScanPhase::Crawl),
            ScanState::Auditing => Some(ScanPhase::Audit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanPhase::Crawl => "crawl",
            ScanPhase::Audit => "audit",
        }
    }
}

impl FromStr for ScanPhase {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crawl" => Ok(ScanPhase::Crawl),
            "audit" => Ok(ScanPhase::Audit),
            other => Err(ModelError::UnknownVariant {
                kind: "scan phase",
                value: other.to_string(),
            }),
        }
    }
}

/// How far the crawler may wander from the target URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ScanScope {
    /// Only URLs below the target path.
    Path,
    /// Any URL on the target host.
    #[default]
    Domain,
    /// The target host and all of its subdomains.
    Subdomain,
}

impl ScanScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanScope::Path => "path",
            ScanScope::Domain => "domain",
            ScanScope::Subdomain => "subdomain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ScanType {
    Crawl,
    Audit,
    Passive,
}

/// Operator-selected scan settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanConfig {
    pub depth: u32,
    pub scope: ScanScope,
    pub scan_types: BTreeSet<ScanType>,
}

impl ScanConfig {
    pub fn wants(&self, scan_type: ScanType) -> bool {
        self.scan_types.contains(&scan_type)
    }

    /// Audit-only requests skip the crawl; everything else crawls first.
    pub fn first_phase(&self) -> ScanPhase {
        if self.wants(ScanType::Audit) && !self.wants(ScanType::Crawl) {
            ScanPhase::Audit
        } else {
            ScanPhase::Crawl
        }
    }

    /// Whether the crawl phase contributes to the aggregate progress.
    pub fn tracks_crawl(&self) -> bool {
        self.first_phase() == ScanPhase::Crawl
    }
}

/// Per-phase completion, each 0-100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhaseProgress {
    pub crawl: u8,
    pub audit: u8,
    pub passive: u8,
}

/// Identifiers the external engine assigned to this job.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExternalJobRef {
    pub target_ref: String,
    /// Numeric id of the engine context, for calls that want it instead of
    /// the name.
    #[cfg_attr(feature = "serde", serde(default))]
    pub context_id: Option<String>,
    pub crawl_ref: Option<String>,
    pub audit_ref: Option<String>,
}

impl ExternalJobRef {
    pub fn new(target_ref: impl Into<String>) -> Self {
        Self {
            target_ref: target_ref.into(),
            context_id: None,
            crawl_ref: None,
            audit_ref: None,
        }
    }

    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn has_running_task(&self) -> bool {
        self.crawl_ref.is_some() || self.audit_ref.is_some()
    }
}

/// One operator-requested scan of one target.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanJob {
    pub id: ScanJobId,
    pub name: String,
    pub target_url: Url,
    pub config: ScanConfig,
    pub state: ScanState,
    pub progress_percent: u8,
    pub phase_progress: PhaseProgress,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub external_ref: Option<ExternalJobRef>,
    pub resume_phase: Option<ScanPhase>,
    pub last_error: Option<String>,
    pub findings_count: u64,
    pub alert_cursor: Option<u64>,
}

impl ScanJob {
    pub fn new(name: String, target_url: Url, config: ScanConfig) -> Self {
        let now = Utc::now();
        Self {
            id: ScanJobId::new(),
            name,
            target_url,
            config,
            state: ScanState::Queued,
            progress_percent: 0,
            phase_progress: PhaseProgress::default(),
            started_at: now,
            completed_at: None,
            updated_at: now,
            external_ref: None,
            resume_phase: None,
            last_error: None,
            findings_count: 0,
            alert_cursor: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Folds fresh per-phase readings into the job without ever moving
    /// a value backwards.
    pub fn record_progress(&mut self, reading: PhaseProgress) {
        let current = &mut self.phase_progress;
        current.crawl = current.crawl.max(reading.crawl.min(100));
        current.audit = current.audit.max(reading.audit.min(100));
        current.passive = current.passive.max(reading.passive.min(100));

        let mut phases: Vec<u8> = Vec::with_capacity(2);
        if self.config.tracks_crawl() {
            phases.push(current.crawl);
        }
        if self.config.wants(ScanType::Audit) {
            phases.push(current.audit);
        }
        let aggregate = if phases.is_empty() {
            0
        } else {
            let sum: u32 = phases.iter().map(|p| u32::from(*p)).sum();
            (sum / phases.len() as u32) as u8
        };
        self.progress_percent = self.progress_percent.max(aggregate);
    }

    /// Seconds between start and completion, when the job has finished.
    pub fn duration_secs(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_seconds().max(0))
    }
}
