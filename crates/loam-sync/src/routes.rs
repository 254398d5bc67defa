//! Ops router
//!
//! - `GET /health`
//! - `GET /sync/status`: current run state and any pending quota retry
//! - `POST /sync/run`: manual trigger, responds with the invocation outcome

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::scheduler::SchedulerHandle;
use crate::sync::{RunOutcome, Trigger};

/// Build the ops router
pub fn router(handle: SchedulerHandle) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/sync/status", get(sync_status))
        .route("/sync/run", post(trigger_run))
        .with_state(handle)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(tower_http::LatencyUnit::Millis),
                ),
        )
}

/// Health check handler; fails when run state cannot be read
async fn health_check(State(handle): State<SchedulerHandle>) -> Response {
    match handle.sync().status().await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected"
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy" })),
            )
                .into_response()
        },
    }
}

/// GET /sync/status
async fn sync_status(State(handle): State<SchedulerHandle>) -> Response {
    let sync = handle.sync();
    let loaded = match sync.status().await {
        Ok(state) => sync.pending_retry().await.map(|retry| (state, retry)),
        Err(e) => Err(e),
    };

    match loaded {
        Ok((state, retry)) => (
            StatusCode::OK,
            Json(json!({
                "pipeline": sync.config().pipeline,
                "state": state,
                "retry": retry,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to load run state: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to load run state" })),
            )
                .into_response()
        },
    }
}

/// POST /sync/run
async fn trigger_run(State(handle): State<SchedulerHandle>) -> Response {
    let outcome = handle.run(Trigger::Manual).await;

    let status = match &outcome {
        RunOutcome::Finished(_) | RunOutcome::QuotaNotReset { .. } => StatusCode::OK,
        RunOutcome::Skipped { .. } => StatusCode::CONFLICT,
        RunOutcome::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (status, Json(outcome)).into_response()
}
