//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub rooms: usize,
    pub connections: usize,
}

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/healthz", get(health_check))
}

/// Liveness probe with the current room and connection counts
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.sfu.stats();
    Json(HealthResponse {
        status: if state.sfu.is_shutting_down() { "shutting_down" } else { "ok" },
        rooms: stats.active_rooms,
        connections: stats.total_connections,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_sfu::test_helpers::FakeTransport;
    use roomcast_sfu::{LogRecordingObserver, SfuConfig, SfuManager};
    use std::sync::Arc;

    fn state() -> AppState {
        let mut config = SfuConfig::default();
        config.recording.enabled = false;
        AppState {
            sfu: SfuManager::new(config, FakeTransport::new(), Arc::new(LogRecordingObserver)),
            max_message_size: 1024,
        }
    }

    #[tokio::test]
    async fn test_health_reports_rooms() {
        let state = state();
        let Json(empty) = health_check(State(state.clone())).await;
        assert_eq!(empty.status, "ok");
        assert_eq!(empty.rooms, 0);

        let (sink, _outbound) = roomcast_sfu::ChannelSignalSink::channel();
        state
            .sfu
            .join("r1".into(), "alice".into(), Arc::new(sink))
            .await
            .unwrap();

        let Json(busy) = health_check(State(state.clone())).await;
        assert_eq!(busy.rooms, 1);
        assert_eq!(busy.connections, 1);

        state.sfu.shutdown().await;
        let Json(closing) = health_check(State(state)).await;
        assert_eq!(closing.status, "shutting_down");
    }
}
