use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scanwarden_model::api::{CompletedScan, ScanStats, StartScanRequest};
use scanwarden_model::{Finding, FindingId, ScanJob, ScanJobId, ScanState};
use tokio::sync::{Mutex, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::admission::{Admission, StartSlot};
use super::backoff::RetryPolicy;
use super::config::OrchestratorConfig;
use super::reconcile::Reconciler;
use super::state::{ScanTrigger, transition};
use super::validate::validate_request;
use super::worker::{ScanCommand, admit, spawn_worker};
use crate::engine::ScannerEngine;
use crate::error::{Result, ScanError};
use crate::query::ScanQueries;
use crate::store::{FindingQuery, JobFilter, JobStore};

const DEFAULT_FINDINGS_LIMIT: usize = 500;
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Outcome of [`ScanOrchestrator::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub resumed: usize,
    pub failed: usize,
}

pub(crate) struct OrchestratorInner {
    pub(crate) engine: Arc<dyn ScannerEngine>,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) config: OrchestratorConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) admission: Mutex<Admission>,
    pub(crate) shutdown: CancellationToken,
}

impl OrchestratorInner {
    /// Starts workers for queued jobs while slots are free.
    fn pump(self: &Arc<Self>, admission: &mut Admission) {
        if self.shutdown.is_cancelled() {
            return;
        }
        while let Some(job) = admission.next_admissible() {
            let id = job.id;
            info!(scan = %id, "admitting queued scan");
            let handle = spawn_worker(self, job, Reconciler::default());
            admission.insert_running(id, handle);
        }
    }

    pub(crate) async fn on_worker_finished(self: &Arc<Self>, id: ScanJobId) {
        let mut admission = self.admission.lock().await;
        admission.release(id);
        self.pump(&mut admission);
    }

    async fn stored_job(&self, id: ScanJobId) -> Result<ScanJob> {
        self.store.get_job(id).await?.ok_or(ScanError::NotFound(id))
    }

    /// Error for a command aimed at a job without a live worker.
    async fn not_running(&self, id: ScanJobId, action: &'static str) -> ScanError {
        match self.stored_job(id).await {
            Ok(job) => ScanError::InvalidTransition {
                from: job.state,
                action,
            },
            Err(err) => err,
        }
    }
}

/// Front door for every scan command and query.
///
/// Cheap to clone; clones share the same admission state and workers.
#[derive(Clone)]
pub struct ScanOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = self
            .inner
            .admission
            .try_lock()
            .ok()
            .map(|admission| admission.counts());
        f.debug_struct("ScanOrchestrator")
            .field("active_and_queued", &counts)
            .field("max_active_scans", &self.inner.config.max_active_scans)
            .field("shutdown", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl ScanOrchestrator {
    pub fn new(
        engine: Arc<dyn ScannerEngine>,
        store: Arc<dyn JobStore>,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let retry = RetryPolicy::new(config.retry);
        let admission = Mutex::new(Admission::new(config.max_active_scans));
        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                engine,
                store,
                config,
                retry,
                admission,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Validates the request, then either admits the job right away or
    /// queues it behind the active ones.
    ///
    /// When a slot is free the engine is contacted before anything is
    /// stored; if it refuses, or stays unavailable through the retry budget,
    /// no job is created.
    #[instrument(skip(self, request), fields(target = %request.target_url))]
    pub async fn start_scan(&self, request: &StartScanRequest) -> Result<ScanJob> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ScanError::Internal("orchestrator is shutting down".into()));
        }
        let scan = validate_request(request, &self.inner.config)?;
        let mut job = ScanJob::new(scan.name, scan.target_url, scan.config);
        if self.inner.config.reject_duplicate_targets {
            self.ensure_not_completed(&job).await?;
        }

        let slot = {
            let mut admission = self.inner.admission.lock().await;
            if self.inner.config.reject_duplicate_targets
                && admission.target_in_use(&job.target_url)
            {
                return Err(ScanError::ScanAlreadyActive(job.target_url.to_string()));
            }
            admission.begin_start(&job)
        };

        match slot {
            StartSlot::Queue => {
                if let Err(err) = self.inner.store.create_job(&job).await {
                    self.inner.admission.lock().await.abandon_start(job.id);
                    return Err(ScanError::StoreWriteFailure(err.to_string()));
                }
                let mut admission = self.inner.admission.lock().await;
                admission.enqueue_started(job.clone());
                self.inner.pump(&mut admission);
                info!(scan = %job.id, "scan queued");
                Ok(job)
            }
            StartSlot::Reserved => {
                if let Err(err) = self.admit_inline(&mut job).await {
                    warn!(error = %err, "engine refused scan");
                    self.release_start(job.id).await;
                    return Err(err);
                }

                if let Err(err) = self.inner.store.create_job(&job).await {
                    if let Some(external) = job.external_ref.as_ref()
                        && let Err(stop_err) = self.inner.engine.stop(external).await
                    {
                        warn!(error = %stop_err, "could not stop orphaned engine task");
                    }
                    self.release_start(job.id).await;
                    return Err(ScanError::StoreWriteFailure(err.to_string()));
                }

                let mut admission = self.inner.admission.lock().await;
                let reconciler = Reconciler::starting_at(job.alert_cursor);
                let handle = spawn_worker(&self.inner, job.clone(), reconciler);
                admission.confirm_start(job.id, handle);
                info!(scan = %job.id, state = %job.state, "scan started");
                Ok(job)
            }
        }
    }

    /// Admits on the caller's task. Unavailable engines are retried within
    /// the retry budget; refusals fail at once.
    async fn admit_inline(&self, job: &mut ScanJob) -> Result<()> {
        let mut failures: u16 = 0;
        loop {
            let err = match admit(self.inner.engine.as_ref(), job).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };
            failures = failures.saturating_add(1);
            if self.inner.retry.exhausted(failures) {
                return Err(err);
            }
            let delay = self.inner.retry.delay_for(job.id, failures);
            warn!(
                attempt = failures,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "engine unavailable, retrying admission"
            );
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Refuses a start whose name and target match a completed scan.
    async fn ensure_not_completed(&self, job: &ScanJob) -> Result<()> {
        let duplicate = self
            .inner
            .store
            .list_jobs(&JobFilter::terminal())
            .await?
            .into_iter()
            .find(|done| {
                done.state == ScanState::Completed
                    && done.name == job.name
                    && done.target_url == job.target_url
            });
        match duplicate {
            Some(done) => Err(ScanError::DuplicateCompletedScan(done.id)),
            None => Ok(()),
        }
    }

    async fn release_start(&self, id: ScanJobId) {
        let mut admission = self.inner.admission.lock().await;
        admission.abandon_start(id);
        self.inner.pump(&mut admission);
    }

    #[instrument(skip(self))]
    pub async fn pause_scan(&self, id: ScanJobId) -> Result<ScanJob> {
        self.send_command(id, ScanTrigger::Pause.action(), ScanCommand::Pause)
            .await
    }

    #[instrument(skip(self))]
    pub async fn resume_scan(&self, id: ScanJobId) -> Result<ScanJob> {
        self.send_command(id, "resume", ScanCommand::Resume).await
    }

    async fn send_command(
        &self,
        id: ScanJobId,
        action: &'static str,
        command: fn(oneshot::Sender<Result<ScanJob>>) -> ScanCommand,
    ) -> Result<ScanJob> {
        let commands = {
            let admission = self.inner.admission.lock().await;
            if admission.queued(id).is_some() {
                return Err(ScanError::InvalidTransition {
                    from: ScanState::Queued,
                    action,
                });
            }
            match admission.handle(id) {
                Some(handle) => {
                    let state = handle.snapshot.borrow().state;
                    if state.is_terminal() {
                        return Err(ScanError::InvalidTransition {
                            from: state,
                            action,
                        });
                    }
                    Some(handle.commands.clone())
                }
                None => None,
            }
        };

        let Some(commands) = commands else {
            return Err(self.inner.not_running(id, action).await);
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if commands.send(command(reply_tx)).await.is_err() {
            return Err(self.inner.not_running(id, action).await);
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.inner.not_running(id, action).await),
        }
    }

    /// Stops a job from any non-terminal state and returns it once it is
    /// terminal, or in `Stopping` if the engine is still winding down.
    #[instrument(skip(self))]
    pub async fn stop_scan(&self, id: ScanJobId) -> Result<ScanJob> {
        let action = ScanTrigger::Stop.action();
        let (queued, receiver) = {
            let mut admission = self.inner.admission.lock().await;
            match admission.remove_queued(id) {
                Some(entry) => (Some(entry), None),
                None => (
                    None,
                    admission.handle(id).map(|handle| {
                        (handle.snapshot.clone(), handle.cancel.clone())
                    }),
                ),
            }
        };

        if let Some((index, job)) = queued {
            return self.stop_queued(index, job).await;
        }

        let Some((mut receiver, cancel)) = receiver else {
            return Err(self.inner.not_running(id, action).await);
        };

        let current = receiver.borrow().state;
        if current.is_terminal() {
            return Err(ScanError::InvalidTransition {
                from: current,
                action,
            });
        }

        cancel.cancel();
        let deadline = self.inner.config.stop_timeout() + STOP_GRACE;
        let waited = tokio::time::timeout(deadline, async {
            receiver
                .wait_for(|job| job.is_terminal())
                .await
                .map(|job| job.clone())
        })
        .await;

        match waited {
            Ok(Ok(job)) => Ok(job),
            Ok(Err(_)) => self.inner.stored_job(id).await,
            Err(_) => {
                warn!("stop still in progress after deadline");
                Ok(receiver.borrow().clone())
            }
        }
    }

    async fn stop_queued(&self, index: usize, mut job: ScanJob) -> Result<ScanJob> {
        let stopping = transition(job.state, ScanTrigger::Stop)?;
        let stopped = transition(stopping, ScanTrigger::StopAcknowledged)?;
        let original = job.clone();
        let now = Utc::now();
        job.state = stopped;
        job.completed_at = Some(now);
        job.updated_at = now;

        if let Err(err) = self.inner.store.update_job(&job).await {
            self.inner
                .admission
                .lock()
                .await
                .restore_queued(index, original);
            return Err(ScanError::StoreWriteFailure(err.to_string()));
        }
        info!(scan = %job.id, "queued scan stopped");
        Ok(job)
    }

    /// Jobs currently owned by the orchestrator, running or queued.
    pub async fn active_scans(&self) -> Vec<ScanJob> {
        self.inner.admission.lock().await.snapshots()
    }

    pub async fn get_scan(&self, id: ScanJobId) -> Result<ScanJob> {
        if let Some(job) = self.live_snapshot(id).await {
            return Ok(job);
        }
        self.inner.stored_job(id).await
    }

    async fn live_snapshot(&self, id: ScanJobId) -> Option<ScanJob> {
        let admission = self.inner.admission.lock().await;
        admission
            .handle(id)
            .map(|handle| handle.snapshot.borrow().clone())
            .or_else(|| admission.queued(id).cloned())
    }

    /// Every job in creation order, with live state overlaid on stored
    /// rows.
    pub async fn list_scans(&self, filter: &JobFilter) -> Result<Vec<ScanJob>> {
        let stored = self.inner.store.list_jobs(&JobFilter::all()).await?;
        let live = self.active_scans().await;
        Ok(stored
            .into_iter()
            .map(|job| {
                live.iter()
                    .find(|candidate| candidate.id == job.id)
                    .cloned()
                    .unwrap_or(job)
            })
            .filter(|job| filter.matches(job.state))
            .collect())
    }

    /// Terminal jobs, newest first, each with its finding summary.
    pub async fn completed_scans(&self, limit: Option<usize>) -> Result<Vec<CompletedScan>> {
        ScanQueries::new(self.inner.store.as_ref())
            .completed(limit)
            .await
    }

    pub async fn list_findings(&self, query: &FindingQuery) -> Result<Vec<Finding>> {
        if let Some(id) = query.scan_job_id
            && self.live_snapshot(id).await.is_none()
        {
            self.inner.stored_job(id).await?;
        }
        let mut query = query.clone();
        query.limit.get_or_insert(DEFAULT_FINDINGS_LIMIT);
        Ok(self.inner.store.list_findings(&query).await?)
    }

    pub async fn stats(&self) -> Result<ScanStats> {
        let (active, queued) = self.inner.admission.lock().await.counts();
        ScanQueries::new(self.inner.store.as_ref())
            .stats(active as u64, queued as u64)
            .await
    }

    /// Live updates for a job with a worker attached. `None` once the job is
    /// queued, finished, or unknown.
    pub async fn watch_scan(&self, id: ScanJobId) -> Option<watch::Receiver<ScanJob>> {
        self.inner
            .admission
            .lock()
            .await
            .handle(id)
            .map(|handle| handle.snapshot.clone())
    }

    /// Picks up non-terminal jobs left by a previous process. Call once,
    /// before serving commands.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let pending = self
            .inner
            .store
            .list_jobs(&JobFilter::non_terminal())
            .await?;
        let mut report = RecoveryReport::default();

        for mut job in pending {
            let id = job.id;
            match job.state {
                ScanState::Queued => {
                    self.inner.admission.lock().await.enqueue(job);
                    report.requeued += 1;
                }
                ScanState::Crawling | ScanState::Auditing | ScanState::Paused
                    if job.external_ref.is_none() =>
                {
                    let now = Utc::now();
                    job.state = transition(job.state, ScanTrigger::Fail)?;
                    job.completed_at = Some(now);
                    job.updated_at = now;
                    job.resume_phase = None;
                    job.last_error = Some("engine reference lost before restart".into());
                    self.inner.store.update_job(&job).await?;
                    warn!(scan = %id, "scan without engine reference marked failed");
                    report.failed += 1;
                }
                _ => {
                    let known: HashSet<FindingId> = self
                        .inner
                        .store
                        .list_findings(&FindingQuery::for_job(id))
                        .await?
                        .into_iter()
                        .map(|finding| finding.id)
                        .collect();
                    let reconciler = Reconciler::resume(known, job.alert_cursor);
                    let mut admission = self.inner.admission.lock().await;
                    let handle = spawn_worker(&self.inner, job, reconciler);
                    admission.adopt(id, handle);
                    report.resumed += 1;
                }
            }
        }

        let mut admission = self.inner.admission.lock().await;
        self.inner.pump(&mut admission);
        info!(
            requeued = report.requeued,
            resumed = report.resumed,
            failed = report.failed,
            "recovery complete"
        );
        Ok(report)
    }

    /// Detaches every worker. Jobs keep their stored state and are picked up
    /// again by [`recover`](Self::recover) on the next start.
    pub fn shutdown(&self) {
        info!("scan orchestrator shutting down");
        self.inner.shutdown.cancel();
    }
}
