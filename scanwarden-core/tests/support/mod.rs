#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use scanwarden_core::engine::{
    AlertBatch, EngineAlert, EngineError, EngineStatus, ScannerEngine, TargetSubmission,
};
use scanwarden_core::orchestration::{OrchestratorConfig, RetryConfig};
use scanwarden_core::store::{
    FindingQuery, InMemoryJobStore, JobFilter, JobStore, StoreError,
};
use scanwarden_core::{ScanError, ScanOrchestrator};
use scanwarden_model::api::StartScanRequest;
use scanwarden_model::{
    Confidence, ExternalJobRef, Finding, ScanJob, ScanJobId, ScanScope, ScanType, Severity,
    SeverityCounts,
};
use url::Url;

pub const ALERT_PAGE: usize = 2;

/// Canned engine behaviour. Each reading queue yields its values in order and
/// then keeps repeating the last one; an empty queue reads as finished.
#[derive(Debug, Default)]
pub struct EngineScript {
    pub crawl: VecDeque<u8>,
    pub audit: VecDeque<u8>,
    pub passive_backlog: VecDeque<u64>,
    /// Alerts the engine already holds when the test starts.
    pub alerts: Vec<EngineAlert>,
    /// Alerts each started crawl or audit adds to the engine's record, in
    /// start order.
    pub raised: VecDeque<Vec<EngineAlert>>,
    /// Status calls that fail as unavailable before the engine recovers.
    pub status_failures: usize,
    /// Submit calls that fail as unavailable before the engine recovers.
    pub submit_failures: usize,
    pub submit_error: Option<EngineError>,
    /// How long each crawl start takes to answer.
    pub crawl_start_delay: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineCalls {
    pub submit: usize,
    pub crawl: usize,
    pub audit: usize,
    pub status: usize,
    pub alerts: usize,
    pub pause: usize,
    pub resume: usize,
    pub stop: usize,
}

#[derive(Debug, Default)]
pub struct ScriptedEngine {
    script: Mutex<EngineScript>,
    calls: Mutex<EngineCalls>,
    stopped: Mutex<Vec<String>>,
}

fn next_reading<T: Copy>(queue: &mut VecDeque<T>, finished: T) -> T {
    if queue.len() > 1 {
        queue.pop_front().unwrap_or(finished)
    } else {
        queue.front().copied().unwrap_or(finished)
    }
}

impl ScriptedEngine {
    pub fn new(script: EngineScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: Mutex::new(EngineCalls::default()),
            stopped: Mutex::new(Vec::new()),
        })
    }

    /// Target references the engine was asked to stop, in call order.
    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().expect("stopped lock").clone()
    }

    /// Adds an alert to the engine's record, as a running task would.
    pub fn raise(&self, alert: EngineAlert) {
        self.script.lock().expect("script lock").alerts.push(alert);
    }

    pub fn set_crawl_start_delay(&self, delay: Duration) {
        self.script.lock().expect("script lock").crawl_start_delay = delay;
    }

    pub fn calls(&self) -> EngineCalls {
        *self.calls.lock().expect("calls lock")
    }

    pub fn fail_status_forever(&self) {
        self.script.lock().expect("script lock").status_failures = usize::MAX;
    }

    fn record(&self, bump: impl FnOnce(&mut EngineCalls)) {
        bump(&mut self.calls.lock().expect("calls lock"));
    }

    fn raise_for_started_task(&self) {
        let mut script = self.script.lock().expect("script lock");
        if let Some(batch) = script.raised.pop_front() {
            script.alerts.extend(batch);
        }
    }
}

#[async_trait]
impl ScannerEngine for ScriptedEngine {
    async fn submit_target(
        &self,
        submission: &TargetSubmission,
    ) -> Result<ExternalJobRef, EngineError> {
        self.record(|calls| calls.submit += 1);
        let mut script = self.script.lock().expect("script lock");
        if let Some(err) = script.submit_error.clone() {
            return Err(err);
        }
        if script.submit_failures > 0 {
            script.submit_failures -= 1;
            return Err(EngineError::Unavailable("connection refused".into()));
        }
        let target_ref = format!("ctx-{}", submission.scan_job_id);
        Ok(ExternalJobRef::new(target_ref).with_context_id("1"))
    }

    async fn alert_count(&self, _target_url: &Url) -> Result<u64, EngineError> {
        Ok(self.script.lock().expect("script lock").alerts.len() as u64)
    }

    async fn start_crawl(
        &self,
        job: &ExternalJobRef,
        _target_url: &Url,
        _depth: u32,
        _scope: ScanScope,
    ) -> Result<String, EngineError> {
        self.record(|calls| calls.crawl += 1);
        let delay = self.script.lock().expect("script lock").crawl_start_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.raise_for_started_task();
        Ok(format!("{}-crawl", job.target_ref))
    }

    async fn start_audit(
        &self,
        job: &ExternalJobRef,
        _target_url: &Url,
    ) -> Result<String, EngineError> {
        self.record(|calls| calls.audit += 1);
        self.raise_for_started_task();
        Ok(format!("{}-audit", job.target_ref))
    }

    async fn status(&self, job: &ExternalJobRef) -> Result<EngineStatus, EngineError> {
        self.record(|calls| calls.status += 1);
        let mut script = self.script.lock().expect("script lock");
        if script.status_failures > 0 {
            script.status_failures = script.status_failures.saturating_sub(1);
            return Err(EngineError::Unavailable("connection refused".into()));
        }
        let crawl = job
            .crawl_ref
            .as_ref()
            .map(|_| next_reading(&mut script.crawl, 100));
        let audit = job
            .audit_ref
            .as_ref()
            .map(|_| next_reading(&mut script.audit, 100));
        let passive = next_reading(&mut script.passive_backlog, 0);
        Ok(EngineStatus {
            crawl_percent: crawl,
            audit_percent: audit,
            passive_backlog: Some(passive),
        })
    }

    async fn alerts(
        &self,
        _job: &ExternalJobRef,
        _target_url: &Url,
        cursor: Option<u64>,
    ) -> Result<AlertBatch, EngineError> {
        self.record(|calls| calls.alerts += 1);
        let script = self.script.lock().expect("script lock");
        let start = (cursor.unwrap_or(0) as usize).min(script.alerts.len());
        let page: Vec<EngineAlert> = script.alerts[start..]
            .iter()
            .take(ALERT_PAGE)
            .cloned()
            .collect();
        Ok(AlertBatch {
            next_cursor: Some((start + page.len()) as u64),
            has_more: page.len() == ALERT_PAGE,
            alerts: page,
        })
    }

    async fn pause(&self, _job: &ExternalJobRef) -> Result<(), EngineError> {
        self.record(|calls| calls.pause += 1);
        Ok(())
    }

    async fn resume(&self, _job: &ExternalJobRef) -> Result<(), EngineError> {
        self.record(|calls| calls.resume += 1);
        Ok(())
    }

    async fn stop(&self, job: &ExternalJobRef) -> Result<(), EngineError> {
        self.record(|calls| calls.stop += 1);
        self.stopped
            .lock()
            .expect("stopped lock")
            .push(job.target_ref.clone());
        Ok(())
    }
}

/// In-memory store whose job writes can be switched to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryJobStore,
    fail_updates: AtomicBool,
}

impl FlakyStore {
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create_job(&self, job: &ScanJob) -> Result<(), StoreError> {
        self.inner.create_job(job).await
    }

    async fn update_job(&self, job: &ScanJob) -> Result<(), StoreError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Conflict("injected write failure".into()));
        }
        self.inner.update_job(job).await
    }

    async fn append_findings(&self, findings: &[Finding]) -> Result<usize, StoreError> {
        self.inner.append_findings(findings).await
    }

    async fn get_job(&self, id: ScanJobId) -> Result<Option<ScanJob>, StoreError> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScanJob>, StoreError> {
        self.inner.list_jobs(filter).await
    }

    async fn list_findings(&self, query: &FindingQuery) -> Result<Vec<Finding>, StoreError> {
        self.inner.list_findings(query).await
    }

    async fn severity_counts(
        &self,
        scan_job_id: Option<ScanJobId>,
    ) -> Result<SeverityCounts, StoreError> {
        self.inner.severity_counts(scan_job_id).await
    }
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval_ms: 1_000,
        max_active_scans: 1,
        retry: RetryConfig {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 4_000,
            jitter_ratio: 0.0,
            jitter_min_ms: 0,
        },
        stop_timeout_ms: 2_000,
        ..OrchestratorConfig::default()
    }
}

pub fn orchestrator(
    engine: Arc<ScriptedEngine>,
    store: Arc<dyn JobStore>,
) -> ScanOrchestrator {
    ScanOrchestrator::new(engine, store, test_config()).expect("valid config")
}

pub fn request(name: &str, target: &str, types: &[ScanType]) -> StartScanRequest {
    StartScanRequest {
        name: name.into(),
        target_url: target.into(),
        depth: Some(3),
        scope: None,
        scan_types: Some(types.to_vec()),
    }
}

pub fn alert(id: &str, severity: Severity) -> EngineAlert {
    EngineAlert {
        alert_id: id.into(),
        name: format!("alert {id}"),
        severity,
        confidence: Confidence::Firm,
        url: "https://shop.test/login".into(),
        description: "found during test".into(),
        remediation: "No remediation provided".into(),
        parameter: None,
        evidence: None,
        cwe_id: None,
    }
}

/// Polls the orchestrator until the job satisfies `done`. Relies on paused
/// tokio time, so the sleeps cost nothing.
pub async fn wait_until(
    orchestrator: &ScanOrchestrator,
    id: ScanJobId,
    done: impl Fn(&ScanJob) -> bool,
) -> ScanJob {
    for _ in 0..600 {
        match orchestrator.get_scan(id).await {
            Ok(job) if done(&job) => return job,
            Ok(_) => {}
            Err(ScanError::NotFound(_)) => {}
            Err(err) => panic!("unexpected error while waiting: {err}"),
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("scan {id} never reached the expected state");
}

/// Waits until no job holds a slot or sits in the queue, which also means
/// every terminal state has been written.
pub async fn wait_until_idle(orchestrator: &ScanOrchestrator) {
    for _ in 0..600 {
        if orchestrator.active_scans().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("orchestrator never went idle");
}
