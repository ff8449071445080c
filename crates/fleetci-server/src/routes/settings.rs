//! System settings.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/timezone", get(get_timezone).put(update_timezone))
}

#[derive(Debug, Deserialize)]
struct TimezoneRequest {
    timezone: String,
}

async fn get_timezone(State(state): State<AppState>) -> Json<Value> {
    let timezone = state.coordinator.cron().timezone().await;
    Json(json!({ "timezone": timezone.name() }))
}

async fn update_timezone(
    State(state): State<AppState>,
    Json(request): Json<TimezoneRequest>,
) -> Result<Json<Value>, ApiError> {
    let timezone = state
        .coordinator
        .cron()
        .update_timezone(&request.timezone)
        .await?;
    let timers = state.coordinator.cron().len().await;
    Ok(Json(json!({ "timezone": timezone.name(), "timers": timers })))
}
