//! Job submission and cancellation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use fleetci_core::job::JobRecord;
use fleetci_scheduler::{CancelOutcome, QueueStats, SubmitOutcome, SubmitRequest};
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_job))
        .route("/{job_id}", get(get_job).delete(cancel_job))
}

pub fn queue_router() -> Router<AppState> {
    Router::new().route("/", get(queue_stats))
}

async fn submit_job(
    State(state): State<AppState>,
    Json(mut request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitOutcome>), ApiError> {
    if request.job.job_id.trim().is_empty() {
        request.job.job_id = fleetci_core::id::new_job_id();
    }
    let outcome = state.coordinator.dispatcher().submit(request).await?;
    let status = match outcome {
        SubmitOutcome::Dispatched { .. } => StatusCode::CREATED,
        SubmitOutcome::Queued { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    state
        .coordinator
        .dispatcher()
        .job(&job_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {}", job_id)))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelOutcome>, ApiError> {
    let outcome = state.coordinator.dispatcher().cancel(&job_id).await?;
    info!(job_id = %job_id, outcome = ?outcome, "Cancel requested via API");
    Ok(Json(outcome))
}

async fn queue_stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.coordinator.dispatcher().queue_stats().await)
}
