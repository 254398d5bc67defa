//! loam-sync - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loam_common::logging::{init_logging, LogConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use loam_sync::{
    catalog::{CatalogStore, MemoryStore, PgStore},
    config::Config,
    notify,
    provider::PerenualClient,
    routes,
    scheduler::SyncScheduler,
    sync::{CatalogSync, RunOutcome, RunStateStore, Trigger},
};

/// LoamBase catalog sync
#[derive(Parser, Debug)]
#[command(name = "loam-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daily schedule and the ops router until shut down
    Worker {
        /// Serve the ops router without the daily schedule or quota retries
        #[arg(long)]
        no_schedule: bool,
    },

    /// Run one invocation now and print its outcome
    ///
    /// A quota retry it asks for is stored for a running worker to pick up.
    Run {
        /// Keep catalog and run state in memory instead of Postgres
        #[arg(long)]
        in_memory: bool,
    },

    /// Print the pipeline's run state and pending quota retry
    Status,

    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let base = LogConfig::default()
        .with_file_prefix("loam-sync")
        .with_filter_directives("loam_sync=debug,tower_http=info,sqlx=warn");
    let base = if cli.verbose {
        LogConfig {
            level: loam_common::logging::LogLevel::Debug,
            ..base
        }
    } else {
        base
    };

    // Environment variables take precedence
    let log_config = match LogConfig::from_env_with(base) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        },
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Error: {:#}", e);
        std::process::exit(2);
    }

    if let Err(e) = execute(cli.command).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn execute(command: Command) -> Result<()> {
    let mut config = Config::load()?;

    match command {
        Command::Worker { no_schedule } => worker(config, no_schedule).await,
        Command::Run { in_memory } => {
            let sync = if in_memory {
                info!("Using in-memory catalog, nothing will be persisted");
                // A retry stored in memory would die with the process
                config.sync.enabled = false;
                let store = Arc::new(MemoryStore::new());
                build_sync(&config, store.clone(), store)?
            } else {
                let store = Arc::new(PgStore::new(connect(&config).await?));
                build_sync(&config, store.clone(), store)?
            };

            let outcome = sync.run(Trigger::Manual).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);

            if let RunOutcome::Failed { error } = outcome {
                anyhow::bail!("Invocation failed: {}", error);
            }
            Ok(())
        },
        Command::Status => {
            let store = PgStore::new(connect(&config).await?);
            let state = store.load(&config.sync.pipeline).await?;
            let retry = store.pending_retry(&config.sync.pipeline).await?;
            let status = serde_json::json!({ "state": state, "retry": retry });
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        },
        Command::Migrate => {
            connect(&config).await?;
            Ok(())
        },
    }
}

async fn worker(mut config: Config, no_schedule: bool) -> Result<()> {
    info!("Starting loam-sync worker");

    if no_schedule {
        config.sync.enabled = false;
    }

    let store = Arc::new(PgStore::new(connect(&config).await?));
    let sync = Arc::new(build_sync(&config, store.clone(), store)?);

    let shutdown = CancellationToken::new();
    let scheduler = SyncScheduler::new(sync, shutdown.clone());
    let handle = scheduler.handle();

    let scheduler_task = if config.sync.enabled {
        info!(
            cron_hour_utc = config.sync.cron_hour_utc,
            budget = config.sync.request_budget,
            "Daily catalog sync enabled"
        );
        Some(scheduler.start())
    } else {
        info!("Daily catalog sync disabled (CATALOG_SYNC_ENABLED=false or --no-schedule)");
        None
    };

    let app = routes::router(handle);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Ops router listening on {}", addr);

    let timeout_secs = config.server.shutdown_timeout_secs;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(task) = scheduler_task {
        info!("Waiting up to {} seconds for the scheduler to stop", timeout_secs);
        if tokio::time::timeout(Duration::from_secs(timeout_secs), task)
            .await
            .is_err()
        {
            error!("Scheduler did not stop in time; an in-flight run will be taken over once stale");
        }
    }

    info!("Worker shut down gracefully");
    Ok(())
}

fn build_sync(
    config: &Config,
    catalog: Arc<dyn CatalogStore>,
    runs: Arc<dyn RunStateStore>,
) -> Result<CatalogSync> {
    let provider = PerenualClient::new(&config.provider, config.sync.page_size)
        .context("Failed to build Perenual client")?;
    let notifier = notify::from_config(&config.notify)?;

    Ok(CatalogSync::new(
        config.sync.clone(),
        Arc::new(provider),
        catalog,
        runs,
        notifier,
    ))
}

/// Connect to Postgres and apply pending migrations
async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;

    info!("Database connection pool established");

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;

    info!("Database migrations completed");

    Ok(pool)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
