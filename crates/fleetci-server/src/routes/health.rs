//! Health check endpoints.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if state.coordinator.shutdown_coordinator().is_shutting_down() {
        return Err(ApiError::Unavailable("shutting down".into()));
    }
    if let Some(pool) = &state.pool {
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map_err(|e| ApiError::Unavailable(format!("database: {}", e)))?;
    }
    let agents = state.coordinator.dispatcher().agents().await.len();
    Ok(Json(json!({
        "status": "ready",
        "agents": agents,
        "clients": state.events.client_count(),
    })))
}
