//! API routes.

pub mod agents;
pub mod cron;
pub mod health;
pub mod jobs;
pub mod settings;

use crate::AppState;
use crate::agent_ws::agent_ws_handler;
use crate::ws::ws_handler;
use axum::Router;
use axum::routing::get;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .route("/ws", get(ws_handler))
        .route("/agent/ws", get(agent_ws_handler))
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/queue", jobs::queue_router())
        .nest("/agents", agents::router())
        .nest("/cron", cron::router())
        .nest("/projects", cron::project_router())
        .nest("/settings", settings::router())
}
