//! # Scanwarden Core
//!
//! Drives an external web-application scanner through the lifecycle of a
//! scan job and keeps a durable record of every job and finding.
//!
//! ## Overview
//!
//! - [`engine`]: the [`ScannerEngine`](engine::ScannerEngine) boundary and
//!   the ZAP adapter behind it
//! - [`orchestration`]: admission with a concurrency cap, one worker task
//!   per running job, bounded retry with backoff, and alert reconciliation
//! - [`store`]: the [`JobStore`](store::JobStore) trait with in-memory and
//!   PostgreSQL implementations
//! - [`query`]: dashboard statistics and completed-scan summaries
//!
//! ## Feature Flags
//!
//! - `postgres` (default): enables [`store::PostgresJobStore`] and the
//!   embedded migrations

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod engine;
pub mod error;
pub mod orchestration;
pub mod query;
pub mod store;

pub use error::{Result, ScanError};
pub use orchestration::{OrchestratorConfig, RecoveryReport, ScanOrchestrator};

/// Schema migrations for [`store::PostgresJobStore`].
#[cfg(feature = "postgres")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
