//! Shared fixtures for the loam-sync integration tests
//!
//! [`Harness`] wires a [`CatalogSync`] to an in-memory store, a scripted
//! provider and a recording notifier. [`TestPostgres`] starts a throwaway
//! Postgres container with migrations applied (requires Docker).

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::info;

use loam_sync::catalog::MemoryStore;
use loam_sync::config::SyncConfig;
use loam_sync::sync::{
    CatalogSync, InvocationReport, PendingRetry, RunOutcome, RunState, RunStateStore, Trigger,
};
use loam_sync::testing::{RecordingNotifier, ScriptedProvider};

pub const PIPELINE: &str = "perenual_catalog";
pub const SOURCE: &str = "perenual";

/// Initialize tracing for tests, once per binary
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,loam_sync=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}

pub fn sync_config(budget: u32, page_size: u32) -> SyncConfig {
    SyncConfig {
        request_budget: budget,
        page_size,
        ..SyncConfig::default()
    }
}

/// Pipeline over a scripted catalog of `pages` x `page_size` items
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<ScriptedProvider>,
    pub notifier: Arc<RecordingNotifier>,
    pub sync: CatalogSync,
}

impl Harness {
    pub fn new(pages: u32, page_size: u32, budget: u32) -> Self {
        Self::with_config(pages, sync_config(budget, page_size))
    }

    pub fn with_config(pages: u32, config: SyncConfig) -> Self {
        init_test_tracing();

        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(ScriptedProvider::with_catalog(pages, config.page_size));
        let notifier = Arc::new(RecordingNotifier::new());
        let sync = CatalogSync::new(
            config,
            provider.clone(),
            store.clone(),
            store.clone(),
            notifier.clone(),
        );

        Self {
            store,
            provider,
            notifier,
            sync,
        }
    }

    /// Run a manual invocation and return the provider calls it made
    pub async fn run(&self, trigger: Trigger) -> (RunOutcome, usize) {
        let before = self.provider.calls();
        let outcome = self.sync.run(trigger).await;
        (outcome, self.provider.calls() - before)
    }

    /// Run and expect the invocation to finish
    pub async fn finish(&self, trigger: Trigger) -> InvocationReport {
        match self.sync.run(trigger).await {
            RunOutcome::Finished(report) => report,
            other => panic!("expected a finished invocation, got {:?}", other),
        }
    }

    pub async fn pending_retry(&self) -> Option<PendingRetry> {
        self.store.pending_retry(PIPELINE).await.unwrap()
    }

    pub async fn state(&self) -> RunState {
        self.store
            .load(PIPELINE)
            .await
            .unwrap()
            .expect("run state row should exist")
    }
}

/// Postgres container with migrations applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!(
                "postgresql://postgres:postgres@{}:{}/postgres",
                host, port
            ))
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
