//! Scan job state machine. Every state change goes through [`transition`].

use std::fmt;

use scanwarden_model::{ScanPhase, ScanState};

use crate::error::{Result, ScanError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTrigger {
    /// Admission granted and the engine accepted the first phase.
    Admit(ScanPhase),
    /// Crawl hit 100%; `audit_next` says whether an audit follows.
    CrawlFinished { audit_next: bool },
    AuditFinished,
    Pause,
    /// Back to the phase remembered at pause time.
    Resume(ScanPhase),
    Stop,
    StopAcknowledged,
    Fail,
}

impl ScanTrigger {
    pub fn action(self) -> &'static str {
        match self {
            ScanTrigger::Admit(_) => "admit",
            ScanTrigger::CrawlFinished { .. } => "finish crawling",
            ScanTrigger::AuditFinished => "finish auditing",
            ScanTrigger::Pause => "pause",
            ScanTrigger::Resume(_) => "resume",
            ScanTrigger::Stop => "stop",
            ScanTrigger::StopAcknowledged => "acknowledge stop of",
            ScanTrigger::Fail => "fail",
        }
    }
}

impl fmt::Display for ScanTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action())
    }
}

pub fn transition(from: ScanState, trigger: ScanTrigger) -> Result<ScanState> {
    use ScanState::*;
    use ScanTrigger as T;

    let to = match (from, trigger) {
        (Queued, T::Admit(phase)) => phase.state(),
        (Crawling, T::CrawlFinished { audit_next: true }) => Auditing,
        (Crawling, T::CrawlFinished { audit_next: false }) => Completed,
        (Auditing, T::AuditFinished) => Completed,
        (Crawling | Auditing | Paused, T::Pause) => Paused,
        (Paused, T::Resume(phase)) => phase.state(),
        (Queued | Crawling | Auditing | Paused | Stopping, T::Stop) => Stopping,
        (Stopping, T::StopAcknowledged) => Stopped,
        (Queued | Crawling | Auditing | Paused | Stopping, T::Fail) => Failed,
        _ => {
            return Err(ScanError::InvalidTransition {
                from,
                action: trigger.action(),
            });
        }
    };
    Ok(to)
}
