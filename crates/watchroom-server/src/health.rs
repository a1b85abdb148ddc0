use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

/// Structured health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub connections: ConnectionInfo,
    pub rooms: RoomInfo,
}

#[derive(Serialize)]
pub struct ConnectionInfo {
    pub websocket: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub active: usize,
    pub playing: usize,
    pub participants: usize,
    pub in_voice: usize,
    pub videos_played: usize,
}

/// Returns server status, open sockets, and room activity as JSON.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let websocket = state.ws_connection_count.load(Ordering::Relaxed);
    let stats = state.rooms.read().await.stats();

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        connections: ConnectionInfo { websocket },
        rooms: RoomInfo {
            active: stats.rooms,
            playing: stats.playing,
            participants: stats.participants,
            in_voice: stats.in_voice,
            videos_played: stats.videos_played,
        },
    })
}
