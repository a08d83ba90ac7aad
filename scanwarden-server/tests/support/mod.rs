#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use axum_test::TestServer;
use scanwarden_core::ScanOrchestrator;
use scanwarden_core::engine::{
    AlertBatch, EngineAlert, EngineError, EngineStatus, ScannerEngine, TargetSubmission,
};
use scanwarden_core::store::InMemoryJobStore;
use scanwarden_model::{Confidence, ExternalJobRef, ScanScope, Severity};
use scanwarden_server::infra::config::Config;
use scanwarden_server::{AppState, create_app};
use serde_json::Value;
use url::Url;

/// Engine that finishes every phase on the first poll unless told to hold.
#[derive(Debug, Default)]
pub struct StubEngine {
    hold: AtomicBool,
}

impl StubEngine {
    pub fn holding() -> Arc<Self> {
        Arc::new(Self {
            hold: AtomicBool::new(true),
        })
    }

    pub fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
    }

    fn percent(&self) -> u8 {
        if self.hold.load(Ordering::SeqCst) { 10 } else { 100 }
    }
}

#[async_trait]
impl ScannerEngine for StubEngine {
    async fn submit_target(
        &self,
        submission: &TargetSubmission,
    ) -> Result<ExternalJobRef, EngineError> {
        Ok(ExternalJobRef::new(format!("ctx-{}", submission.scan_job_id)))
    }

    async fn alert_count(&self, _target_url: &Url) -> Result<u64, EngineError> {
        Ok(0)
    }

    async fn start_crawl(
        &self,
        job: &ExternalJobRef,
        _target_url: &Url,
        _depth: u32,
        _scope: ScanScope,
    ) -> Result<String, EngineError> {
        Ok(format!("{}-crawl", job.target_ref))
    }

    async fn start_audit(
        &self,
        job: &ExternalJobRef,
        _target_url: &Url,
    ) -> Result<String, EngineError> {
        Ok(format!("{}-audit", job.target_ref))
    }

    async fn status(&self, job: &ExternalJobRef) -> Result<EngineStatus, EngineError> {
        let percent = self.percent();
        Ok(EngineStatus {
            crawl_percent: job.crawl_ref.as_ref().map(|_| percent),
            audit_percent: job.audit_ref.as_ref().map(|_| percent),
            passive_backlog: Some(0),
        })
    }

    async fn alerts(
        &self,
        _job: &ExternalJobRef,
        target_url: &Url,
        cursor: Option<u64>,
    ) -> Result<AlertBatch, EngineError> {
        let alerts = if cursor.unwrap_or(0) == 0 {
            vec![EngineAlert {
                alert_id: "40012".into(),
                name: "Cross Site Scripting (Reflected)".into(),
                severity: Severity::High,
                confidence: Confidence::Firm,
                url: target_url.to_string(),
                description: "reflected input".into(),
                remediation: "Encode output".into(),
                parameter: Some("q".into()),
                evidence: Some("<script>".into()),
                cwe_id: Some(79),
            }]
        } else {
            Vec::new()
        };
        Ok(AlertBatch {
            next_cursor: Some(1),
            has_more: false,
            alerts,
        })
    }

    async fn pause(&self, _job: &ExternalJobRef) -> Result<(), EngineError> {
        Ok(())
    }

    async fn resume(&self, _job: &ExternalJobRef) -> Result<(), EngineError> {
        Ok(())
    }

    async fn stop(&self, _job: &ExternalJobRef) -> Result<(), EngineError> {
        Ok(())
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.orchestrator.poll_interval_ms = 20;
    config.orchestrator.max_active_scans = 1;
    config.orchestrator.stop_timeout_ms = 500;
    config.orchestrator.retry.backoff_base_ms = 10;
    config.orchestrator.retry.backoff_max_ms = 50;
    config
}

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub engine: Arc<StubEngine>,
}

pub fn build_test_app(engine: Arc<StubEngine>) -> anyhow::Result<TestApp> {
    let config = Arc::new(test_config());
    let orchestrator = ScanOrchestrator::new(
        engine.clone(),
        Arc::new(InMemoryJobStore::new()),
        config.orchestrator.clone(),
    )?;
    let state = AppState::new(orchestrator, config, None);
    let server = TestServer::builder()
        .build(create_app(state.clone()))
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(TestApp {
        server,
        state,
        engine,
    })
}

/// Polls the scan resource until its state matches.
pub async fn wait_for_state(server: &TestServer, id: &str, state: &str) -> Value {
    for _ in 0..200 {
        let body: Value = server.get(&format!("/api/v1/scans/{id}")).await.json();
        if body["data"]["state"] == state {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("scan {id} never reached {state}");
}

/// Waits until no job holds a slot or sits in the queue, which also means
/// every final state has been written to the store.
pub async fn wait_until_idle(server: &TestServer) {
    for _ in 0..200 {
        let body: Value = server.get("/api/v1/scans/active").await.json();
        if body["data"].as_array().is_some_and(Vec::is_empty) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("scans never drained");
}
