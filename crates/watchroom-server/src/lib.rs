pub mod chat;
pub mod config;
pub mod error;
pub mod health;
pub mod playback;
pub mod queue;
pub mod room;
pub mod room_manager;
pub mod state;
pub mod voice;
pub mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::routing::get;
use tokio::time::MissedTickBehavior;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use watchroom_core::time::timestamp_now_ms;

use config::ServerConfig;
use state::AppState;

/// Build the Axum router and application state from a config.
pub fn build_app(config: ServerConfig) -> (Router<()>, AppState) {
    let web_root = config.web_root.clone();
    let state = AppState::new(config);

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health::health_check))
        .fallback_service(ServeDir::new(&web_root))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    (app, state)
}

/// Start the inactivity reaper and, unless disabled, the periodic clock
/// rebroadcast. Both loops run for the life of the runtime.
pub fn spawn_background_tasks(state: &AppState) {
    let rooms = Arc::clone(&state.rooms);
    let cleanup_every = Duration::from_secs(state.config.rooms.cleanup_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cleanup_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = rooms.write().await.cleanup_inactive_rooms(Instant::now());
            if removed > 0 {
                tracing::info!(removed, "Reaped inactive rooms");
            }
        }
    });

    let sync_secs = state.config.rooms.sync_broadcast_interval_secs;
    if sync_secs == 0 {
        tracing::info!("Periodic clock rebroadcast disabled");
        return;
    }
    let rooms = Arc::clone(&state.rooms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(sync_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            rooms.read().await.broadcast_clock_sync(timestamp_now_ms());
        }
    });
}
