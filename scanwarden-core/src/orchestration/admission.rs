use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use scanwarden_model::{ScanJob, ScanJobId, ScanState};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::worker::ScanCommand;

/// Control surface of one running worker.
pub(crate) struct ScanHandle {
    pub(crate) snapshot: watch::Receiver<ScanJob>,
    pub(crate) commands: mpsc::Sender<ScanCommand>,
    pub(crate) cancel: CancellationToken,
}

impl fmt::Debug for ScanHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanHandle")
            .field("state", &self.snapshot.borrow().state)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// How a new start request gets a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartSlot {
    /// A slot was free and is now held for the caller.
    Reserved,
    /// The caller must queue the job.
    Queue,
}

/// A start request between slot decision and its store write.
#[derive(Debug)]
struct PendingStart {
    target: Url,
    slot: StartSlot,
    started_at: DateTime<Utc>,
}

/// Slot accounting, FIFO queue, and the map of running workers.
///
/// Lives behind one short-lived mutex; nothing in here awaits. At most one
/// job per target holds a slot at a time, since the engine reports alerts
/// per target.
#[derive(Debug)]
pub(crate) struct Admission {
    capacity: usize,
    slots_in_use: usize,
    /// Ordered by creation time.
    queue: VecDeque<ScanJob>,
    running: HashMap<ScanJobId, ScanHandle>,
    pending: HashMap<ScanJobId, PendingStart>,
}

impl Admission {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots_in_use: 0,
            queue: VecDeque::new(),
            running: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// A new start may take a slot only when nothing older is waiting,
    /// queue-bound starts still writing their row included.
    fn slot_free(&self) -> bool {
        self.queue.is_empty()
            && !self
                .pending
                .values()
                .any(|pending| pending.slot == StartSlot::Queue)
            && self.slots_in_use < self.capacity
    }

    /// True while a job on `target` holds a slot and has not finished.
    fn target_live(&self, target: &Url) -> bool {
        self.pending.values().any(|pending| {
            pending.slot == StartSlot::Reserved && &pending.target == target
        }) || self.running.values().any(|handle| {
            let job = handle.snapshot.borrow();
            !job.is_terminal() && &job.target_url == target
        })
    }

    /// True when a queue-bound start created before `job` has not reached
    /// the queue yet.
    fn older_start_pending(&self, job: &ScanJob) -> bool {
        self.pending.iter().any(|(id, pending)| {
            pending.slot == StartSlot::Queue
                && (pending.started_at, *id) < (job.started_at, job.id)
        })
    }

    pub(crate) fn begin_start(&mut self, job: &ScanJob) -> StartSlot {
        let slot = if self.slot_free() && !self.target_live(&job.target_url) {
            self.slots_in_use += 1;
            StartSlot::Reserved
        } else {
            StartSlot::Queue
        };
        self.pending.insert(
            job.id,
            PendingStart {
                target: job.target_url.clone(),
                slot,
                started_at: job.started_at,
            },
        );
        slot
    }

    /// Drops a pending start, returning its slot if it held one.
    pub(crate) fn abandon_start(&mut self, id: ScanJobId) {
        if let Some(PendingStart {
            slot: StartSlot::Reserved,
            ..
        }) = self.pending.remove(&id)
        {
            self.slots_in_use = self.slots_in_use.saturating_sub(1);
        }
    }

    /// Turns a reserved start into a running worker.
    pub(crate) fn confirm_start(&mut self, id: ScanJobId, handle: ScanHandle) {
        self.pending.remove(&id);
        self.running.insert(id, handle);
    }

    /// Turns a queue-bound start into a queued job.
    pub(crate) fn enqueue_started(&mut self, job: ScanJob) {
        self.pending.remove(&job.id);
        self.enqueue(job);
    }

    pub(crate) fn enqueue(&mut self, job: ScanJob) {
        let key = (job.started_at, job.id);
        let index = self
            .queue
            .iter()
            .position(|queued| (queued.started_at, queued.id) > key)
            .unwrap_or(self.queue.len());
        self.queue.insert(index, job);
    }

    /// Adopts a worker for a job the engine is already running. May exceed
    /// capacity; the queue simply waits longer.
    pub(crate) fn adopt(&mut self, id: ScanJobId, handle: ScanHandle) {
        if self.running.insert(id, handle).is_none() {
            self.slots_in_use += 1;
        }
    }

    /// Takes the oldest queued job whose target is idle if a slot is free,
    /// reserving that slot.
    pub(crate) fn next_admissible(&mut self) -> Option<ScanJob> {
        if self.slots_in_use >= self.capacity {
            return None;
        }
        let index = self.queue.iter().position(|job| {
            !self.target_live(&job.target_url) && !self.older_start_pending(job)
        })?;
        let job = self.queue.remove(index)?;
        self.slots_in_use += 1;
        Some(job)
    }

    pub(crate) fn insert_running(&mut self, id: ScanJobId, handle: ScanHandle) {
        self.running.insert(id, handle);
    }

    pub(crate) fn release(&mut self, id: ScanJobId) {
        if self.running.remove(&id).is_some() {
            self.slots_in_use = self.slots_in_use.saturating_sub(1);
        }
    }

    pub(crate) fn remove_queued(&mut self, id: ScanJobId) -> Option<(usize, ScanJob)> {
        let index = self.queue.iter().position(|job| job.id == id)?;
        self.queue.remove(index).map(|job| (index, job))
    }

    pub(crate) fn restore_queued(&mut self, index: usize, job: ScanJob) {
        let index = index.min(self.queue.len());
        self.queue.insert(index, job);
    }

    pub(crate) fn queued(&self, id: ScanJobId) -> Option<&ScanJob> {
        self.queue.iter().find(|job| job.id == id)
    }

    pub(crate) fn handle(&self, id: ScanJobId) -> Option<&ScanHandle> {
        self.running.get(&id)
    }

    pub(crate) fn target_in_use(&self, target: &Url) -> bool {
        self.pending.values().any(|pending| &pending.target == target)
            || self.queue.iter().any(|job| &job.target_url == target)
            || self.running.values().any(|handle| {
                let job = handle.snapshot.borrow();
                !job.is_terminal() && &job.target_url == target
            })
    }

    /// Copies of every job the orchestrator is responsible for right now.
    pub(crate) fn snapshots(&self) -> Vec<ScanJob> {
        let mut jobs: Vec<ScanJob> = self
            .running
            .values()
            .map(|handle| handle.snapshot.borrow().clone())
            .chain(self.queue.iter().cloned())
            .collect();
        jobs.sort_by_key(|job| (job.started_at, job.id));
        jobs
    }

    pub(crate) fn counts(&self) -> (usize, usize) {
        let queued_running = self
            .running
            .values()
            .filter(|handle| handle.snapshot.borrow().state == ScanState::Queued)
            .count();
        (
            self.running.len() - queued_running,
            self.queue.len() + queued_running,
        )
    }

    #[cfg(test)]
    pub(crate) fn slots_in_use(&self) -> usize {
        self.slots_in_use
    }
}
