//! Connected agents.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use fleetci_scheduler::AgentSummary;
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_agents))
        .route("/{agent_id}/capacity", put(set_capacity))
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentSummary>> {
    Json(state.coordinator.dispatcher().agents().await)
}

#[derive(Debug, Deserialize)]
struct CapacityRequest {
    max_concurrent_jobs: u32,
}

async fn set_capacity(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<CapacityRequest>,
) -> Result<StatusCode, ApiError> {
    if request.max_concurrent_jobs == 0 {
        return Err(ApiError::BadRequest(
            "max_concurrent_jobs must be positive".into(),
        ));
    }
    state
        .coordinator
        .dispatcher()
        .set_agent_capacity(&agent_id, request.max_concurrent_jobs)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
