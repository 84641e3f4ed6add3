//! Axum Handlers for the HTTP surface
//!
//! The relay answers plain `GET /` with its health status and upgrades the same
//! path to a relay WebSocket when the request asks for one.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::rejection::WebSocketUpgradeRejection,
    },
    response::{IntoResponse, Json, Response},
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::{state::AppState, ws::session};

/// Body of the health check.
#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    /// RFC 3339, millisecond precision, UTC.
    pub timestamp: String,
    /// Client sockets currently open.
    pub connections: usize,
}

impl HealthResponse {
    fn now(state: &AppState) -> Self {
        Self {
            status: "ElevenLabs WebSocket Proxy Server Running",
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            connections: state.client_count(),
        }
    }
}

/// Reports server status, time and the number of connected clients.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse::now(&state))
}

/// Serves the relay socket on upgrade requests and the health check otherwise.
pub async fn root(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match ws {
        Ok(ws) => session::upgrade(ws, state),
        Err(_) => Json(HealthResponse::now(&state)).into_response(),
    }
}
