use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use scanwarden_core::store::PostgresJobStore;
use scanwarden_server::{
    create_app,
    infra::{
        config::{self, Config, ConfigLoad, ConfigLoader, ConfigSource},
        startup,
    },
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "scanwarden-server")]
#[command(about = "Orchestrates web application security scans against a ZAP daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to a TOML or JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Base URL of the ZAP API (overrides config)
    #[arg(long, env = "ZAP_API_URL")]
    engine_url: Option<String>,

    /// PostgreSQL connection string (overrides config)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// How often running scans are polled, e.g. `5s` or `750ms`
    #[arg(long)]
    poll_interval: Option<humantime::Duration>,

    /// Maximum scans running against the engine at once
    #[arg(long)]
    max_active_scans: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        match command {
            Command::Db(DbCommand::Migrate) => {
                run_db_migrate(&cli.serve).await?;
                return Ok(());
            }
        }
    }

    run_server(cli.serve).await
}

async fn run_db_migrate(args: &ServeArgs) -> anyhow::Result<()> {
    let config = load_runtime_config(args)?;
    let Some(url) = config.database.url.as_deref() else {
        bail!("DATABASE_URL is required to run migrations");
    };
    let store = PostgresJobStore::connect(url, 1)
        .await
        .context("failed to connect to PostgreSQL for migration")?;
    store.migrate().await.context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Arc<Config>> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path.clone());
    }
    let ConfigLoad {
        mut config,
        source,
        env_file_loaded,
        ..
    } = loader.load().context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }
    if let Some(url) = args.engine_url.clone() {
        config.engine.base_url = url;
    }
    if let Some(url) = args.database_url.clone() {
        config.database.url = Some(url);
    }
    if let Some(interval) = &args.poll_interval {
        config.orchestrator.poll_interval_ms =
            u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    }
    if let Some(cap) = args.max_active_scans {
        config.orchestrator.max_active_scans = cap;
    }

    // CLI values may have changed what was validated during load.
    let warnings = config::validate(&config).context("invalid configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Per-poll detail lives under scan::poll at debug. Override via RUST_LOG.
                "info,scan::poll=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if env_file_loaded {
        info!("loaded .env file");
    }
    match &source {
        ConfigSource::Default => info!("no config file found, using defaults"),
        ConfigSource::EnvPath(path) | ConfigSource::File(path) => {
            info!(path = %path.display(), "configuration loaded from file")
        }
        ConfigSource::EnvInline => info!("configuration loaded from inline environment json"),
    }
    for warning in &warnings {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    let orchestrator = &config.orchestrator;
    info!(
        orchestrator.max_active_scans = orchestrator.max_active_scans,
        orchestrator.poll_interval_ms = orchestrator.poll_interval_ms,
        orchestrator.retry_max_attempts = orchestrator.retry.max_attempts,
        orchestrator.stop_timeout_ms = orchestrator.stop_timeout_ms,
        "orchestrator configuration in effect"
    );

    Ok(Arc::new(config))
}

async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let config = load_runtime_config(&args)?;
    let state = startup::build_state(config.clone()).await?;
    let orchestrator = state.orchestrator().clone();
    let app = create_app(state);

    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port))
            .await
            .with_context(|| {
                format!("failed to bind {}:{}", config.server.host, config.server.port)
            })?;
    let addr: SocketAddr = listener.local_addr()?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    orchestrator.shutdown();
    info!("Server stopped; running scans will be resumed on next start");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
