//! Job lifecycle: admission, per-job workers, retries, and reconciliation
//! of engine alerts into stored findings.

mod admission;
pub mod backoff;
pub mod config;
mod control;
pub mod reconcile;
pub mod state;
pub mod validate;
mod worker;

pub use backoff::RetryPolicy;
pub use config::{OrchestratorConfig, RetryConfig};
pub use control::{RecoveryReport, ScanOrchestrator};
pub use reconcile::Reconciler;
pub use state::{ScanTrigger, transition};
pub use validate::{ValidatedScan, validate_request};
