use std::{fmt, sync::Arc};

use scanwarden_core::ScanOrchestrator;
use scanwarden_core::store::PostgresJobStore;

use crate::infra::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ScanOrchestrator,
    pub config: Arc<Config>,
    /// Present when jobs are stored in PostgreSQL; used by health checks.
    pub postgres: Option<PostgresJobStore>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("orchestrator", &self.orchestrator)
            .field("postgres", &self.postgres.is_some())
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(
        orchestrator: ScanOrchestrator,
        config: Arc<Config>,
        postgres: Option<PostgresJobStore>,
    ) -> Self {
        Self {
            orchestrator,
            config,
            postgres,
        }
    }

    pub fn orchestrator(&self) -> &ScanOrchestrator {
        &self.orchestrator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store_kind(&self) -> &'static str {
        if self.postgres.is_some() {
            "postgres"
        } else {
            "memory"
        }
    }
}
