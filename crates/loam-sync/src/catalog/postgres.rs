//! PostgreSQL catalog and run state store
//!
//! Catalog rows live in `plants`, keyed by the `(source, external_id)`
//! unique constraint. Run state lives in `sync_runs`, one row per pipeline,
//! and a pending quota retry in `sync_retries` so it survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgExecutor, PgPool};
use tracing::debug;

use super::{CatalogRecord, CatalogStore, UpsertOutcome};
use crate::error::{Result, SyncError};
use crate::sync::retry::PendingRetry;
use crate::sync::state::{Claim, RunState, RunStateStore};

const INCOMPLETE_PREDICATE: &str = "(common_name IS NULL OR scientific_name IS NULL \
     OR plant_type IS NULL OR water_needs IS NULL OR sun_requirement IS NULL)";

const RUN_COLUMNS: &str = "pipeline, status, current_page, total_pages, records_synced, \
     requests_used, started_at, finished_at, error_message";

/// Store backed by a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, FromRow)]
struct PlantRow {
    source: String,
    external_id: String,
    common_name: Option<String>,
    scientific_name: Option<String>,
    plant_type: Option<String>,
    water_needs: Option<String>,
    sun_requirement: Option<String>,
    hardiness_zones: Vec<String>,
    description: Option<String>,
    image_url: Option<String>,
    common_pests: Vec<String>,
}

fn parse_column<T>(value: Option<String>) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .map(|v| v.parse::<T>().map_err(SyncError::Store))
        .transpose()
}

impl TryFrom<PlantRow> for CatalogRecord {
    type Error = SyncError;

    fn try_from(row: PlantRow) -> Result<Self> {
        Ok(CatalogRecord {
            provenance_source: row.source,
            provenance_id: row.external_id,
            common_name: row.common_name,
            scientific_name: row.scientific_name,
            plant_type: parse_column(row.plant_type)?,
            water_needs: parse_column(row.water_needs)?,
            sun_requirement: parse_column(row.sun_requirement)?,
            hardiness_zones: row.hardiness_zones,
            description: row.description,
            image_url: row.image_url,
            common_pests: row.common_pests,
        })
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    pipeline: String,
    status: String,
    current_page: i32,
    total_pages: Option<i32>,
    records_synced: i64,
    requests_used: i32,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

fn to_u32(column: &str, value: i32) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| SyncError::invalid_state(format!("{} is negative: {}", column, value)))
}

fn to_i32(column: &str, value: u32) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| SyncError::invalid_state(format!("{} out of range: {}", column, value)))
}

impl TryFrom<RunRow> for RunState {
    type Error = SyncError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(RunState {
            pipeline: row.pipeline,
            status: row.status.parse()?,
            current_page: to_u32("current_page", row.current_page)?,
            total_pages: row
                .total_pages
                .map(|t| to_u32("total_pages", t))
                .transpose()?,
            records_synced: u64::try_from(row.records_synced).map_err(|_| {
                SyncError::invalid_state(format!(
                    "records_synced is negative: {}",
                    row.records_synced
                ))
            })?,
            requests_used: to_u32("requests_used", row.requests_used)?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error_message: row.error_message,
        })
    }
}

#[derive(Debug, FromRow)]
struct RetryRow {
    attempt: i32,
    retry_at: DateTime<Utc>,
}

async fn write_run<'e, E>(executor: E, state: &RunState) -> Result<()>
where
    E: PgExecutor<'e>,
{
    let records_synced = i64::try_from(state.records_synced).map_err(|_| {
        SyncError::invalid_state(format!(
            "records_synced out of range: {}",
            state.records_synced
        ))
    })?;

    sqlx::query(
        r#"
        INSERT INTO sync_runs (pipeline, status, current_page, total_pages, records_synced,
                               requests_used, started_at, finished_at, error_message, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
        ON CONFLICT (pipeline) DO UPDATE SET
            status = EXCLUDED.status,
            current_page = EXCLUDED.current_page,
            total_pages = EXCLUDED.total_pages,
            records_synced = EXCLUDED.records_synced,
            requests_used = EXCLUDED.requests_used,
            started_at = EXCLUDED.started_at,
            finished_at = EXCLUDED.finished_at,
            error_message = EXCLUDED.error_message,
            updated_at = NOW()
        "#,
    )
    .bind(&state.pipeline)
    .bind(state.status.as_str())
    .bind(to_i32("current_page", state.current_page)?)
    .bind(
        state
            .total_pages
            .map(|t| to_i32("total_pages", t))
            .transpose()?,
    )
    .bind(records_synced)
    .bind(to_i32("requests_used", state.requests_used)?)
    .bind(state.started_at)
    .bind(state.finished_at)
    .bind(&state.error_message)
    .execute(executor)
    .await?;

    Ok(())
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn upsert(&self, record: &CatalogRecord) -> Result<UpsertOutcome> {
        // xmax is 0 only for a freshly inserted tuple
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO plants (source, external_id, common_name, scientific_name, plant_type,
                                water_needs, sun_requirement, hardiness_zones, description,
                                image_url, common_pests, fetched_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, clock_timestamp())
            ON CONFLICT (source, external_id) DO UPDATE SET
                common_name = EXCLUDED.common_name,
                scientific_name = EXCLUDED.scientific_name,
                plant_type = EXCLUDED.plant_type,
                water_needs = EXCLUDED.water_needs,
                sun_requirement = EXCLUDED.sun_requirement,
                hardiness_zones = EXCLUDED.hardiness_zones,
                description = EXCLUDED.description,
                image_url = EXCLUDED.image_url,
                common_pests = EXCLUDED.common_pests,
                fetched_at = EXCLUDED.fetched_at,
                updated_at = NOW()
            RETURNING (xmax = 0)
            "#,
        )
        .bind(&record.provenance_source)
        .bind(&record.provenance_id)
        .bind(&record.common_name)
        .bind(&record.scientific_name)
        .bind(record.plant_type.map(|t| t.as_str()))
        .bind(record.water_needs.map(|w| w.as_str()))
        .bind(record.sun_requirement.map(|s| s.as_str()))
        .bind(&record.hardiness_zones)
        .bind(&record.description)
        .bind(&record.image_url)
        .bind(&record.common_pests)
        .fetch_one(&self.pool)
        .await?;

        debug!(
            source = %record.provenance_source,
            provenance_id = %record.provenance_id,
            inserted,
            "Upserted catalog record"
        );

        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn get(&self, source: &str, provenance_id: &str) -> Result<Option<CatalogRecord>> {
        let row: Option<PlantRow> = sqlx::query_as(
            r#"
            SELECT source, external_id, common_name, scientific_name, plant_type, water_needs,
                   sun_requirement, hardiness_zones, description, image_url, common_pests
            FROM plants
            WHERE source = $1 AND external_id = $2
            "#,
        )
        .bind(source)
        .bind(provenance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CatalogRecord::try_from).transpose()
    }

    async fn incomplete_records(&self, source: &str, limit: u32) -> Result<Vec<String>> {
        let query = format!(
            "SELECT external_id FROM plants \
             WHERE source = $1 AND external_id IS NOT NULL AND {INCOMPLETE_PREDICATE} \
             ORDER BY fetched_at ASC NULLS FIRST, length(external_id), external_id \
             LIMIT $2"
        );

        let ids: Vec<String> = sqlx::query_scalar(&query)
            .bind(source)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    async fn count_incomplete(&self, source: &str) -> Result<u64> {
        let query = format!(
            "SELECT COUNT(*) FROM plants WHERE source = $1 AND {INCOMPLETE_PREDICATE}"
        );
        let count: i64 = sqlx::query_scalar(&query)
            .bind(source)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_records(&self, source: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM plants WHERE source = $1")
            .bind(source)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl RunStateStore for PgStore {
    async fn load(&self, pipeline: &str) -> Result<Option<RunState>> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE pipeline = $1"
        ))
        .bind(pipeline)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunState::try_from).transpose()
    }

    async fn try_begin(
        &self,
        pipeline: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<Claim> {
        let mut tx = self.pool.begin().await?;

        // Row lock serialises competing claims across processes
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE pipeline = $1 FOR UPDATE"
        ))
        .bind(pipeline)
        .fetch_optional(&mut *tx)
        .await?;
        let existing = row.map(RunState::try_from).transpose()?;

        let claim = RunState::claim(existing.as_ref(), pipeline, now, stale_after);

        match &claim {
            Claim::Started {
                state,
                previous: None,
            } => {
                // No row to lock yet; a concurrent first claim loses on the key
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO sync_runs (pipeline, status, current_page, started_at)
                    VALUES ($1, 'running', 0, $2)
                    ON CONFLICT (pipeline) DO NOTHING
                    "#,
                )
                .bind(&state.pipeline)
                .bind(state.started_at)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if inserted == 0 {
                    tx.rollback().await?;
                    let current = self.load(pipeline).await?.ok_or_else(|| {
                        SyncError::invalid_state(format!(
                            "run state for {} vanished during claim",
                            pipeline
                        ))
                    })?;
                    return Ok(Claim::AlreadyRunning(current));
                }
            },
            Claim::Started { state, .. } => write_run(&mut *tx, state).await?,
            Claim::AlreadyRunning(_) | Claim::AlreadyComplete(_) => {},
        }

        tx.commit().await?;
        Ok(claim)
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        write_run(&self.pool, state).await
    }

    async fn restore(&self, pipeline: &str, snapshot: Option<&RunState>) -> Result<()> {
        match snapshot {
            Some(previous) => write_run(&self.pool, previous).await,
            None => {
                sqlx::query("DELETE FROM sync_runs WHERE pipeline = $1")
                    .bind(pipeline)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            },
        }
    }

    async fn pending_retry(&self, pipeline: &str) -> Result<Option<PendingRetry>> {
        let row: Option<RetryRow> =
            sqlx::query_as("SELECT attempt, retry_at FROM sync_retries WHERE pipeline = $1")
                .bind(pipeline)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|row| -> Result<PendingRetry> {
            Ok(PendingRetry {
                attempt: to_u32("attempt", row.attempt)?,
                at: row.retry_at,
            })
        })
        .transpose()
    }

    async fn set_retry(&self, pipeline: &str, retry: Option<&PendingRetry>) -> Result<()> {
        match retry {
            Some(retry) => {
                sqlx::query(
                    r#"
                    INSERT INTO sync_retries (pipeline, attempt, retry_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (pipeline) DO UPDATE SET
                        attempt = EXCLUDED.attempt,
                        retry_at = EXCLUDED.retry_at,
                        created_at = NOW()
                    "#,
                )
                .bind(pipeline)
                .bind(to_i32("attempt", retry.attempt)?)
                .bind(retry.at)
                .execute(&self.pool)
                .await?;
            },
            None => {
                sqlx::query("DELETE FROM sync_retries WHERE pipeline = $1")
                    .bind(pipeline)
                    .execute(&self.pool)
                    .await?;
            },
        }
        Ok(())
    }
}
