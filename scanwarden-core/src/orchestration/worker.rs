//! Per-job task. The worker is the only writer of its job's state; everyone
//! else reads copies out of the watch channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scanwarden_model::{
    ExternalJobRef, PhaseProgress, ScanJob, ScanJobId, ScanPhase, ScanState,
    ScanType,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use url::Url;

use super::admission::ScanHandle;
use super::control::OrchestratorInner;
use super::reconcile::Reconciler;
use super::state::{ScanTrigger, transition};
use crate::engine::{EngineError, EngineStatus, ScannerEngine, TargetSubmission};
use crate::error::{Result, ScanError};

const COMMAND_BUFFER: usize = 8;

pub(crate) enum ScanCommand {
    Pause(oneshot::Sender<Result<ScanJob>>),
    Resume(oneshot::Sender<Result<ScanJob>>),
}

enum Exit {
    Finished,
    Shutdown,
}

/// Submits the target, records the alert baseline and starts the first
/// phase. On failure whatever was obtained so far stays on `job` so a retry
/// does not resubmit.
pub(crate) async fn admit(engine: &dyn ScannerEngine, job: &mut ScanJob) -> Result<()> {
    let external = match job.external_ref.take() {
        Some(existing) => existing,
        None => {
            let submission = TargetSubmission {
                scan_job_id: job.id,
                target_url: job.target_url.clone(),
                scope: job.config.scope,
            };
            engine.submit_target(&submission).await?
        }
    };
    let external = job.external_ref.insert(external);

    // Alerts already on record for this target belong to earlier scans.
    if job.alert_cursor.is_none() {
        job.alert_cursor = Some(engine.alert_count(&job.target_url).await?);
    }

    let phase = job.config.first_phase();
    match phase {
        ScanPhase::Crawl => {
            let crawl_ref = engine
                .start_crawl(
                    external,
                    &job.target_url,
                    job.config.depth,
                    job.config.scope,
                )
                .await?;
            external.crawl_ref = Some(crawl_ref);
        }
        ScanPhase::Audit => {
            let audit_ref = engine.start_audit(external, &job.target_url).await?;
            external.audit_ref = Some(audit_ref);
        }
    }

    job.state = transition(job.state, ScanTrigger::Admit(phase))?;
    job.updated_at = Utc::now();
    Ok(())
}

pub(crate) fn spawn_worker(
    inner: &Arc<OrchestratorInner>,
    job: ScanJob,
    reconciler: Reconciler,
) -> ScanHandle {
    let span = info_span!("scan", scan = %job.id, target = %job.target_url);
    let (job_tx, job_rx) = watch::channel(job);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let cancel = CancellationToken::new();

    let worker = ScanWorker {
        inner: Arc::clone(inner),
        job: job_tx,
        commands: command_rx,
        cancel: cancel.clone(),
        reconciler,
        failures: 0,
        passive_peak: 0,
    };
    tokio::spawn(worker.run().instrument(span));

    ScanHandle {
        snapshot: job_rx,
        commands: command_tx,
        cancel,
    }
}

struct ScanWorker {
    inner: Arc<OrchestratorInner>,
    job: watch::Sender<ScanJob>,
    commands: mpsc::Receiver<ScanCommand>,
    cancel: CancellationToken,
    reconciler: Reconciler,
    failures: u16,
    passive_peak: u64,
}

impl ScanWorker {
    async fn run(mut self) {
        match self.drive().await {
            Exit::Finished => debug!("scan worker finished"),
            Exit::Shutdown => debug!("scan worker detached for shutdown"),
        }
    }

    fn snapshot(&self) -> ScanJob {
        self.job.borrow().clone()
    }

    fn state(&self) -> ScanState {
        self.job.borrow().state
    }

    fn id(&self) -> ScanJobId {
        self.job.borrow().id
    }

    fn update(&self, apply: impl FnOnce(&mut ScanJob)) {
        self.job.send_modify(|job| {
            apply(job);
            job.updated_at = Utc::now();
        });
    }

    async fn drive(&mut self) -> Exit {
        let cancel = self.cancel.clone();
        let shutdown = self.inner.shutdown.clone();

        if self.state() == ScanState::Queued {
            if let Some(exit) = self.admit_with_retry(&cancel, &shutdown).await {
                return exit;
            }
        }

        let mut delay = self.inner.config.poll_interval();
        loop {
            match self.state() {
                state if state.is_terminal() => return Exit::Finished,
                ScanState::Stopping => {
                    self.stop_and_finalize().await;
                    return Exit::Finished;
                }
                ScanState::Paused => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Exit::Shutdown,
                        _ = cancel.cancelled() => self.begin_stop().await,
                        command = self.commands.recv() => match command {
                            Some(command) => {
                                if self.handle_command(command).await {
                                    delay = Duration::ZERO;
                                }
                            }
                            None => return Exit::Shutdown,
                        },
                    }
                }
                _ => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Exit::Shutdown,
                        _ = cancel.cancelled() => self.begin_stop().await,
                        Some(command) = self.commands.recv() => {
                            self.handle_command(command).await;
                        }
                        _ = tokio::time::sleep(delay) => {
                            let observed = tokio::select! {
                                biased;
                                _ = shutdown.cancelled() => return Exit::Shutdown,
                                _ = cancel.cancelled() => None,
                                result = self.observe() => Some(result),
                            };
                            // Phase changes run to completion so a started
                            // engine task is never left without its reference.
                            let outcome = match observed {
                                None => None,
                                Some(Ok(status)) => Some(self.apply(&status).await),
                                Some(Err(err)) => Some(Err(err)),
                            };
                            delay = match outcome {
                                None => Duration::ZERO,
                                Some(Ok(())) => {
                                    self.failures = 0;
                                    self.inner.config.poll_interval()
                                }
                                Some(Err(err)) => self.on_fault(err).await,
                            };
                        }
                    }
                }
            }
        }
    }

    async fn admit_with_retry(
        &mut self,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Option<Exit> {
        let mut delay = Duration::ZERO;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Some(Exit::Shutdown),
                _ = cancel.cancelled() => {
                    self.begin_stop().await;
                    return None;
                }
                Some(command) = self.commands.recv() => {
                    self.handle_command(command).await;
                }
                _ = tokio::time::sleep(delay) => {
                    let mut job = self.snapshot();
                    let engine = Arc::clone(&self.inner.engine);
                    // Not raced against stop: dropping a start call midway
                    // would lose the reference of a task the engine runs.
                    let result = admit(engine.as_ref(), &mut job).await;
                    match result {
                        Ok(()) => {
                            info!(phase = %job.state, "scan admitted");
                            self.reconciler = Reconciler::starting_at(job.alert_cursor);
                            self.job.send_replace(job);
                            self.failures = 0;
                            if let Err(err) = self.persist().await {
                                warn!(error = %err, "failed to record admission");
                                self.failures = 1;
                            }
                            if cancel.is_cancelled() {
                                self.begin_stop().await;
                            }
                            return None;
                        }
                        Err(err) => {
                            let external = job.external_ref.clone();
                            let cursor = job.alert_cursor;
                            self.update(|current| {
                                current.external_ref = external;
                                current.alert_cursor = cursor;
                            });
                            if cancel.is_cancelled() {
                                debug!(error = %err, "admission interrupted by stop");
                                self.begin_stop().await;
                                return None;
                            }
                            delay = self.on_fault(err).await;
                            if self.state().is_terminal() {
                                return None;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Counts a fault against the retry budget and returns the delay before
    /// the next attempt. Non-transient faults and an exhausted budget fail
    /// the job.
    async fn on_fault(&mut self, err: ScanError) -> Duration {
        if !err.is_transient() {
            error!(error = %err, "scan failed");
            self.finalize(ScanTrigger::Fail, Some(err.to_string())).await;
            return Duration::ZERO;
        }

        self.failures = self.failures.saturating_add(1);
        if self.inner.retry.exhausted(self.failures) {
            error!(
                attempts = self.failures,
                error = %err,
                "retry budget exhausted, failing scan"
            );
            self.finalize(ScanTrigger::Fail, Some(err.to_string())).await;
            return Duration::ZERO;
        }

        let delay = self.inner.retry.delay_for(self.id(), self.failures);
        warn!(
            attempt = self.failures,
            max_attempts = self.inner.retry.max_attempts(),
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "transient scan fault"
        );
        delay
    }

    /// Returns true when polling should resume right away.
    async fn handle_command(&mut self, command: ScanCommand) -> bool {
        match command {
            ScanCommand::Pause(reply) => {
                let result = self.pause().await;
                let _ = reply.send(result);
                false
            }
            ScanCommand::Resume(reply) => {
                let result = self.resume().await;
                let resumed = result.is_ok();
                let _ = reply.send(result);
                resumed
            }
        }
    }

    async fn pause(&mut self) -> Result<ScanJob> {
        let job = self.snapshot();
        let next = transition(job.state, ScanTrigger::Pause)?;
        if job.state == ScanState::Paused {
            return Ok(job);
        }

        let external = job.external_ref.as_ref().ok_or_else(|| {
            ScanError::Internal(format!("scan {} has no engine reference", job.id))
        })?;
        self.inner.engine.pause(external).await?;

        let phase = ScanPhase::of_state(job.state);
        self.update(|job| {
            job.resume_phase = phase;
            job.state = next;
        });
        info!("scan paused");
        self.persist_best_effort().await;
        Ok(self.snapshot())
    }

    async fn resume(&mut self) -> Result<ScanJob> {
        let job = self.snapshot();
        let phase = match (job.state, job.resume_phase) {
            (ScanState::Paused, Some(phase)) => phase,
            (ScanState::Paused, None) => job.config.first_phase(),
            (from, _) => {
                return Err(ScanError::InvalidTransition {
                    from,
                    action: "resume",
                });
            }
        };
        let next = transition(job.state, ScanTrigger::Resume(phase))?;

        let external = job.external_ref.as_ref().ok_or_else(|| {
            ScanError::Internal(format!("scan {} has no engine reference", job.id))
        })?;
        self.inner.engine.resume(external).await?;

        self.update(|job| {
            job.state = next;
            job.resume_phase = None;
        });
        info!(phase = phase.as_str(), "scan resumed");
        self.persist_best_effort().await;
        Ok(self.snapshot())
    }

    /// Reads engine status and imports new alerts. Safe to abandon midway.
    async fn observe(&mut self) -> Result<EngineStatus> {
        let job = self.snapshot();
        let external = job.external_ref.clone().ok_or_else(|| {
            ScanError::Internal(format!("scan {} has no engine reference", job.id))
        })?;

        let status = self.inner.engine.status(&external).await?;
        self.reconcile(&external, &job.target_url).await?;
        Ok(status)
    }

    async fn apply(&mut self, status: &EngineStatus) -> Result<()> {
        let job = self.snapshot();
        let reading = self.reading(&job, status);
        self.update(|job| job.record_progress(reading));
        debug!(
            target: "scan::poll",
            crawl = reading.crawl,
            audit = reading.audit,
            passive = reading.passive,
            findings = self.reconciler.known_count(),
            "poll complete"
        );

        if let Some(trigger) = self.advance(status).await? {
            self.finalize(trigger, None).await;
            return Ok(());
        }
        self.persist().await
    }

    fn reading(&mut self, job: &ScanJob, status: &EngineStatus) -> PhaseProgress {
        let passive = if job.config.wants(ScanType::Passive) {
            match status.passive_backlog {
                Some(0) => 100,
                Some(pending) => {
                    self.passive_peak = self.passive_peak.max(pending);
                    let done = self.passive_peak - pending;
                    (done * 100 / self.passive_peak) as u8
                }
                None => 0,
            }
        } else {
            0
        };
        PhaseProgress {
            crawl: status.crawl_percent.unwrap_or(0),
            audit: status.audit_percent.unwrap_or(0),
            passive,
        }
    }

    /// Moves the job to its next phase when the current one is done.
    /// Returns the trigger to finalize with once nothing is left to run.
    async fn advance(&mut self, status: &EngineStatus) -> Result<Option<ScanTrigger>> {
        let job = self.snapshot();
        let passive_done = !job.config.wants(ScanType::Passive)
            || status.passive_backlog == Some(0);

        match job.state {
            ScanState::Crawling if job.phase_progress.crawl >= 100 => {
                if job.config.wants(ScanType::Audit) {
                    let external = job.external_ref.as_ref().ok_or_else(|| {
                        ScanError::Internal(format!(
                            "scan {} has no engine reference",
                            job.id
                        ))
                    })?;
                    let audit_ref = self
                        .inner
                        .engine
                        .start_audit(external, &job.target_url)
                        .await?;
                    let next = transition(
                        job.state,
                        ScanTrigger::CrawlFinished { audit_next: true },
                    )?;
                    self.update(|job| {
                        job.state = next;
                        if let Some(external) = job.external_ref.as_mut() {
                            external.audit_ref = Some(audit_ref);
                        }
                    });
                    info!("crawl finished, audit started");
                    Ok(None)
                } else if passive_done {
                    Ok(Some(ScanTrigger::CrawlFinished { audit_next: false }))
                } else {
                    Ok(None)
                }
            }
            ScanState::Auditing
                if job.phase_progress.audit >= 100 && passive_done =>
            {
                Ok(Some(ScanTrigger::AuditFinished))
            }
            _ => Ok(None),
        }
    }

    async fn reconcile(&mut self, external: &ExternalJobRef, target: &Url) -> Result<()> {
        let id = self.id();
        for _ in 0..self.inner.config.max_alert_pages_per_poll.max(1) {
            let batch = self
                .inner
                .engine
                .alerts(external, target, self.reconciler.cursor())
                .await?;
            let fresh = self.reconciler.fresh(id, &batch, Utc::now());
            if !fresh.is_empty() {
                let inserted = self
                    .inner
                    .store
                    .append_findings(&fresh)
                    .await
                    .map_err(|err| ScanError::StoreWriteFailure(err.to_string()))?;
                if inserted > 0 {
                    info!(new_findings = inserted, "findings recorded");
                }
            }
            self.reconciler.commit(&fresh, batch.next_cursor);

            let known = self.reconciler.known_count();
            let cursor = self.reconciler.cursor();
            self.update(|job| {
                job.findings_count = known;
                job.alert_cursor = cursor;
            });

            if !batch.has_more {
                break;
            }
        }
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let job = self.snapshot();
        self.inner
            .store
            .update_job(&job)
            .await
            .map_err(|err| ScanError::StoreWriteFailure(err.to_string()))
    }

    async fn persist_best_effort(&self) {
        if let Err(err) = self.persist().await {
            warn!(error = %err, "failed to persist scan state, next poll will retry");
        }
    }

    async fn begin_stop(&mut self) {
        let current = self.state();
        match transition(current, ScanTrigger::Stop) {
            Ok(next) => {
                self.update(|job| job.state = next);
                info!(from = %current, "stopping scan");
                self.persist_best_effort().await;
            }
            Err(err) => debug!(error = %err, "stop ignored"),
        }
    }

    async fn stop_and_finalize(&mut self) {
        let job = self.snapshot();
        if let Some(external) = job
            .external_ref
            .as_ref()
            .filter(|external| external.has_running_task())
        {
            let outcome =
                tokio::time::timeout(self.inner.config.stop_timeout(), self.stop_engine(external))
                    .await;
            match outcome {
                Ok(Ok(())) => debug!("engine acknowledged stop"),
                Ok(Err(err)) => warn!(error = %err, "engine stop failed, finalizing anyway"),
                Err(_) => warn!("engine stop timed out, finalizing anyway"),
            }
        }
        self.finalize(ScanTrigger::StopAcknowledged, None).await;
    }

    async fn stop_engine(&self, external: &ExternalJobRef) -> std::result::Result<(), EngineError> {
        let id = self.id();
        let mut attempt: u16 = 0;
        loop {
            attempt += 1;
            match self.inner.engine.stop(external).await {
                Ok(()) => return Ok(()),
                Err(err @ EngineError::Rejected(_)) => return Err(err),
                Err(err) if self.inner.retry.exhausted(attempt) => return Err(err),
                Err(err) => {
                    debug!(attempt, error = %err, "retrying engine stop");
                    tokio::time::sleep(self.inner.retry.delay_for(id, attempt)).await;
                }
            }
        }
    }

    /// Enters a terminal state: last reconciliation pass, `completed_at`,
    /// durable write, slot release.
    async fn finalize(&mut self, trigger: ScanTrigger, error: Option<String>) {
        let job = self.snapshot();
        let next = match transition(job.state, trigger)
            .or_else(|_| transition(job.state, ScanTrigger::Fail))
        {
            Ok(next) => next,
            Err(err) => {
                debug!(error = %err, "scan already terminal");
                return;
            }
        };

        if let Some(external) = job
            .external_ref
            .as_ref()
            .filter(|external| external.has_running_task())
        {
            if let Err(err) = self.reconcile(external, &job.target_url).await {
                warn!(error = %err, "final reconciliation failed");
            }
        }

        let now = Utc::now();
        self.job.send_modify(|job| {
            job.state = next;
            job.completed_at = Some(now);
            job.updated_at = now;
            job.resume_phase = None;
            if next == ScanState::Completed {
                job.progress_percent = 100;
            }
            if error.is_some() {
                job.last_error = error;
            }
        });

        self.persist_final().await;
        let finished = self.snapshot();
        info!(
            state = %finished.state,
            findings = finished.findings_count,
            duration_secs = finished.duration_secs().unwrap_or_default(),
            "scan finished"
        );
        self.inner.on_worker_finished(finished.id).await;
    }

    /// Retries the terminal write until it lands. The slot stays held
    /// meanwhile, so reads keep serving the live terminal snapshot.
    async fn persist_final(&self) {
        let id = self.id();
        let max_attempts = self.inner.retry.max_attempts().max(1);
        let mut attempt: u16 = 0;
        loop {
            let Err(err) = self.persist().await else {
                return;
            };
            attempt = attempt.saturating_add(1);
            if attempt == max_attempts {
                error!(error = %err, "failed to persist terminal scan state, still retrying");
            } else {
                debug!(attempt, error = %err, "retrying terminal write");
            }
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => {
                    warn!("terminal state not persisted before shutdown");
                    return;
                }
                _ = tokio::time::sleep(self.inner.retry.delay_for(id, attempt)) => {}
            }
        }
    }
}
