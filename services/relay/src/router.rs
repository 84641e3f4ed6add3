//! Axum Router Configuration
//!
//! This module defines the HTTP routing for the relay: the health check and the
//! client WebSocket endpoint.

use crate::{handlers, state::AppState, ws::ws_handler};

use axum::{Router, routing::get};
use std::sync::Arc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        // Clients connect to the bare server URL, so `/` serves both.
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .route("/ws", get(ws_handler))
        .with_state(app_state)
}
