//! Core data model definitions shared across Scanwarden crates.
#![allow(missing_docs)]

#[cfg(feature = "serde")]
pub mod api;
pub mod error;
pub mod finding;
pub mod ids;
pub mod scan;

pub use error::{ModelError, Result as ModelResult};
pub use finding::{Confidence, Finding, Severity, SeverityCounts};
pub use ids::{FindingId, ScanJobId};
pub use scan::{
    ExternalJobRef, PhaseProgress, ScanConfig, ScanJob, ScanPhase, ScanScope,
    ScanState, ScanType,
};
