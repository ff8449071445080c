//! FleetCI coordinator server.
//!
//! HTTP API, the agent WebSocket channel and the dashboard event stream.

pub mod agent_ws;
pub mod broadcast;
pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use broadcast::ChannelBroadcaster;
pub use state::AppState;
