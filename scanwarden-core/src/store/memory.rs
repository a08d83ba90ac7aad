use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use scanwarden_model::{Finding, FindingId, ScanJob, ScanJobId, SeverityCounts};
use tokio::sync::RwLock;

use super::{FindingQuery, JobFilter, JobStore, StoreError};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<ScanJobId, ScanJob>,
    order: Vec<ScanJobId>,
    findings: Vec<Finding>,
    finding_ids: HashSet<FindingId>,
}

impl MemoryState {
    fn ensure_unique_target_ref(&self, job: &ScanJob) -> Result<(), StoreError> {
        let Some(target_ref) = job.external_ref.as_ref().map(|r| &r.target_ref)
        else {
            return Ok(());
        };
        let clash = self.jobs.values().any(|other| {
            other.id != job.id
                && other
                    .external_ref
                    .as_ref()
                    .is_some_and(|r| &r.target_ref == target_ref)
        });
        if clash {
            return Err(StoreError::Conflict(format!(
                "engine reference {target_ref} already belongs to another job"
            )));
        }
        Ok(())
    }
}

/// Process-local store. Backs tests and deployments without a database.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: RwLock<MemoryState>,
}

impl fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryJobStore");
        match self.state.try_read() {
            Ok(state) => debug
                .field("jobs", &state.jobs.len())
                .field("findings", &state.findings.len()),
            Err(_) => debug.field("state", &"<locked>"),
        };
        debug.finish()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: &ScanJob) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!(
                "scan job {} already exists",
                job.id
            )));
        }
        state.ensure_unique_target_ref(job)?;
        state.order.push(job.id);
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &ScanJob) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.jobs.contains_key(&job.id) {
            return Err(StoreError::NotFound(job.id));
        }
        state.ensure_unique_target_ref(job)?;
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn append_findings(
        &self,
        findings: &[Finding],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        if let Some(orphan) = findings
            .iter()
            .find(|finding| !state.jobs.contains_key(&finding.scan_job_id))
        {
            return Err(StoreError::NotFound(orphan.scan_job_id));
        }

        let mut inserted = 0;
        for finding in findings {
            if state.finding_ids.insert(finding.id) {
                state.findings.push(finding.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_job(&self, id: ScanJobId) -> Result<Option<ScanJob>, StoreError> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScanJob>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| filter.matches(job.state))
            .cloned()
            .collect())
    }

    async fn list_findings(
        &self,
        query: &FindingQuery,
    ) -> Result<Vec<Finding>, StoreError> {
        let state = self.state.read().await;
        let matching = state
            .findings
            .iter()
            .rev()
            .filter(|finding| query.matches(finding))
            .cloned();
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn severity_counts(
        &self,
        scan_job_id: Option<ScanJobId>,
    ) -> Result<SeverityCounts, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .findings
            .iter()
            .filter(|finding| scan_job_id.is_none_or(|id| finding.scan_job_id == id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use scanwarden_model::{
        Confidence, ExternalJobRef, ScanConfig, ScanScope, ScanType, Severity,
    };
    use url::Url;

    fn job() -> ScanJob {
        ScanJob::new(
            "nightly".into(),
            Url::parse("https://shop.test/").expect("url"),
            ScanConfig {
                depth: 2,
                scope: ScanScope::Domain,
                scan_types: [ScanType::Crawl].into_iter().collect(),
            },
        )
    }

    fn finding(job: &ScanJob, alert: &str, severity: Severity) -> Finding {
        Finding {
            id: FindingId::derive(job.id, alert),
            scan_job_id: job.id,
            engine_alert_id: alert.into(),
            name: format!("alert {alert}"),
            severity,
            confidence: Confidence::Firm,
            url: "https://shop.test/".into(),
            description: String::new(),
            remediation: String::new(),
            parameter: None,
            evidence: None,
            cwe_id: None,
            discovered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_findings_skips_known_ids() {
        let store = InMemoryJobStore::new();
        let job = job();
        store.create_job(&job).await.expect("create");

        let first = vec![
            finding(&job, "1", Severity::High),
            finding(&job, "2", Severity::Low),
        ];
        assert_eq!(store.append_findings(&first).await.expect("append"), 2);

        let second = vec![
            finding(&job, "2", Severity::Low),
            finding(&job, "3", Severity::Info),
        ];
        assert_eq!(store.append_findings(&second).await.expect("append"), 1);

        let counts = store.severity_counts(Some(job.id)).await.expect("counts");
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.high, 1);
    }

    #[tokio::test]
    async fn external_reference_belongs_to_one_job() {
        let store = InMemoryJobStore::new();
        let mut first = job();
        first.external_ref = Some(ExternalJobRef::new("ctx-1"));
        store.create_job(&first).await.expect("create");

        let mut second = job();
        second.external_ref = Some(ExternalJobRef::new("ctx-1"));
        assert!(matches!(
            store.create_job(&second).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn findings_for_unknown_job_are_refused() {
        let store = InMemoryJobStore::new();
        let orphan = finding(&job(), "1", Severity::Medium);
        assert!(matches!(
            store.append_findings(&[orphan]).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
