use scanwarden_model::{ScanJobId, ScanState};
use thiserror::Error;

use crate::engine::EngineError;
use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Invalid scan configuration: {0}")]
    InvalidConfig(String),

    #[error("Cannot {action} a scan that is {from}")]
    InvalidTransition {
        from: ScanState,
        action: &'static str,
    },

    #[error("Scan not found: {0}")]
    NotFound(ScanJobId),

    #[error("A scan is already active for {0}")]
    ScanAlreadyActive(String),

    #[error("Scan {0} already completed with this name and target")]
    DuplicateCompletedScan(ScanJobId),

    #[error("Scanner engine unavailable: {0}")]
    ExternalEngineUnavailable(String),

    #[error("Scanner engine rejected the request: {0}")]
    ExternalEngineRejected(String),

    #[error("Job store write failed: {0}")]
    StoreWriteFailure(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Transient faults that count against the retry budget instead of
    /// failing the job outright.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScanError::ExternalEngineUnavailable(_)
                | ScanError::StoreWriteFailure(_)
        )
    }
}

impl From<EngineError> for ScanError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(msg) => {
                ScanError::ExternalEngineUnavailable(msg)
            }
            EngineError::Rejected(msg) => ScanError::ExternalEngineRejected(msg),
        }
    }
}

impl From<StoreError> for ScanError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ScanError::NotFound(id),
            other => ScanError::StoreWriteFailure(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
