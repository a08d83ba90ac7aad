use std::collections::HashSet;

use chrono::{DateTime, Utc};
use scanwarden_model::{Finding, FindingId, ScanJobId};

use crate::engine::{AlertBatch, EngineAlert};

/// Tracks what has already been stored for one job so repeated polls only
/// ever append new findings.
#[derive(Debug, Default)]
pub struct Reconciler {
    known: HashSet<FindingId>,
    cursor: Option<u64>,
}

impl Reconciler {
    /// Rebuilds the tracker from stored state after a restart.
    pub fn resume(
        known: impl IntoIterator<Item = FindingId>,
        cursor: Option<u64>,
    ) -> Self {
        Self {
            known: known.into_iter().collect(),
            cursor,
        }
    }

    /// Fresh tracker that skips alerts before `cursor`.
    pub fn starting_at(cursor: Option<u64>) -> Self {
        Self {
            known: HashSet::new(),
            cursor,
        }
    }

    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    pub fn known_count(&self) -> u64 {
        self.known.len() as u64
    }

    /// Findings in `batch` not yet stored, deduplicated within the batch.
    pub fn fresh(
        &self,
        scan_job_id: ScanJobId,
        batch: &AlertBatch,
        now: DateTime<Utc>,
    ) -> Vec<Finding> {
        let mut seen = HashSet::new();
        batch
            .alerts
            .iter()
            .map(|alert| finding_from_alert(scan_job_id, alert, now))
            .filter(|finding| !self.known.contains(&finding.id))
            .filter(|finding| seen.insert(finding.id))
            .collect()
    }

    /// Records a successful store write. Only call after the append landed,
    /// otherwise a failed write would drop findings for good.
    pub fn commit(&mut self, stored: &[Finding], next_cursor: Option<u64>) {
        self.known.extend(stored.iter().map(|finding| finding.id));
        if next_cursor.is_some() {
            self.cursor = next_cursor;
        }
    }
}

pub fn finding_from_alert(
    scan_job_id: ScanJobId,
    alert: &EngineAlert,
    discovered_at: DateTime<Utc>,
) -> Finding {
    Finding {
        id: FindingId::derive(scan_job_id, &alert.alert_id),
        scan_job_id,
        engine_alert_id: alert.alert_id.clone(),
        name: alert.name.clone(),
        severity: alert.severity,
        confidence: alert.confidence,
        url: alert.url.clone(),
        description: alert.description.clone(),
        remediation: alert.remediation.clone(),
        parameter: alert.parameter.clone(),
        evidence: alert.evidence.clone(),
        cwe_id: alert.cwe_id,
        discovered_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanwarden_model::{Confidence, Severity};

    fn alert(id: &str) -> EngineAlert {
        EngineAlert {
            alert_id: id.into(),
            name: "SQL Injection".into(),
            severity: Severity::High,
            confidence: Confidence::Firm,
            url: "https://shop.test/search?q=1".into(),
            description: String::new(),
            remediation: "Use bound parameters".into(),
            parameter: Some("q".into()),
            evidence: None,
            cwe_id: Some(89),
        }
    }

    fn batch(ids: &[&str], next_cursor: Option<u64>) -> AlertBatch {
        AlertBatch {
            alerts: ids.iter().map(|id| alert(id)).collect(),
            next_cursor,
            has_more: false,
        }
    }

    #[test]
    fn full_listing_is_deduplicated_against_known_ids() {
        let job = ScanJobId::new();
        let now = Utc::now();
        let mut reconciler = Reconciler::default();

        let first = reconciler.fresh(job, &batch(&["1", "2", "2"], None), now);
        assert_eq!(first.len(), 2);
        reconciler.commit(&first, None);

        let second = reconciler.fresh(job, &batch(&["1", "2", "3"], None), now);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].engine_alert_id, "3");
        assert_eq!(reconciler.cursor(), None);
    }

    #[test]
    fn uncommitted_findings_are_offered_again() {
        let job = ScanJobId::new();
        let reconciler = Reconciler::default();
        let now = Utc::now();
        let attempt = reconciler.fresh(job, &batch(&["9"], Some(1)), now);
        let retry = reconciler.fresh(job, &batch(&["9"], Some(1)), now);
        assert_eq!(attempt.len(), 1);
        assert_eq!(retry.len(), 1);
        assert_eq!(reconciler.cursor(), None);
    }

    #[test]
    fn cursor_advances_on_commit() {
        let job = ScanJobId::new();
        let mut reconciler = Reconciler::resume([FindingId::derive(job, "1")], Some(1));
        let fresh = reconciler.fresh(job, &batch(&["2"], Some(2)), Utc::now());
        reconciler.commit(&fresh, Some(2));
        assert_eq!(reconciler.cursor(), Some(2));
        assert_eq!(reconciler.known_count(), 2);
    }
}
