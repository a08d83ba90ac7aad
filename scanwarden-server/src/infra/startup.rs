//! Wires the engine, store, and orchestrator from configuration.

use std::sync::Arc;

use anyhow::Context;
use scanwarden_core::ScanOrchestrator;
use scanwarden_core::engine::ZapEngine;
use scanwarden_core::store::{InMemoryJobStore, JobStore, PostgresJobStore};
use tracing::{info, warn};

use crate::infra::{app_state::AppState, config::Config};

pub async fn connect_postgres(config: &Config) -> anyhow::Result<Option<PostgresJobStore>> {
    let Some(url) = config.database.url.as_deref() else {
        return Ok(None);
    };
    let store = PostgresJobStore::connect(url, config.database.max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    store.migrate().await.context("database migration failed")?;
    info!("Successfully connected to PostgreSQL");
    Ok(Some(store))
}

/// Builds application state and picks up jobs left by a previous run.
pub async fn build_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let engine = ZapEngine::new(config.engine.clone())
        .context("failed to build scanner engine client")?;
    info!(engine = %config.engine.base_url, "scanner engine configured");

    let postgres = connect_postgres(&config).await?;
    let store: Arc<dyn JobStore> = match &postgres {
        Some(pg) => Arc::new(pg.clone()),
        None => {
            warn!("no database configured, scan jobs are kept in memory only");
            Arc::new(InMemoryJobStore::new())
        }
    };

    let orchestrator =
        ScanOrchestrator::new(Arc::new(engine), store, config.orchestrator.clone())
            .context("invalid orchestrator configuration")?;
    let report = orchestrator
        .recover()
        .await
        .context("failed to recover scan jobs")?;
    if report != Default::default() {
        info!(
            resumed = report.resumed,
            requeued = report.requeued,
            failed = report.failed,
            "recovered scan jobs from previous run"
        );
    }

    Ok(AppState::new(orchestrator, config, postgres))
}
