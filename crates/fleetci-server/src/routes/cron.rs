//! Cron trigger management.

use axum::extract::{Path, State};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use fleetci_core::workflow::{Edge, Node};
use fleetci_scheduler::{CronTimerInfo, ScheduleReport};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_timers))
        .route("/{job_id}", delete(remove_timer))
}

pub fn project_router() -> Router<AppState> {
    Router::new().route("/{project_id}/cron", put(schedule_project).delete(remove_project))
}

#[derive(Debug, Deserialize)]
struct WorkflowGraph {
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
}

async fn list_timers(State(state): State<AppState>) -> Json<Vec<CronTimerInfo>> {
    Json(state.coordinator.cron().list().await)
}

async fn remove_timer(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let existed = state.coordinator.cron().remove(&job_id).await?;
    Ok(Json(json!({ "job_id": job_id, "stopped": existed })))
}

async fn schedule_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(graph): Json<WorkflowGraph>,
) -> Result<Json<ScheduleReport>, ApiError> {
    let report = state
        .coordinator
        .cron()
        .schedule(&project_id, &graph.nodes, &graph.edges)
        .await?;
    Ok(Json(report))
}

async fn remove_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let removed = state.coordinator.cron().remove_project(&project_id).await?;
    Ok(Json(json!({ "project_id": project_id, "removed": removed })))
}
