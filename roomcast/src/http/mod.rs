// Module: http
// Signaling WebSocket and liveness probe

pub mod error;
pub mod health;
pub mod websocket;

use axum::{routing::get, Router};
use roomcast_sfu::SfuManager;
use std::sync::Arc;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub sfu: Arc<SfuManager>,
    /// Largest signaling frame accepted from a client, in bytes
    pub max_message_size: usize,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .merge(health::create_health_router())
        .with_state(state)
}
