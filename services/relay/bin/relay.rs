//! Main Entrypoint for the Voice Relay Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Starting the relay task with the ElevenLabs connector.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use axum::http::HeaderValue;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use voice_relay::{
    config::Config,
    router::create_router,
    state::AppState,
    ws::{Relay, provider::ElevenLabsConnector},
};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// Builds the CORS layer: an explicit origin list with credentials, or fully open.
fn cors_layer(allowed_origins: Option<&[String]>) -> anyhow::Result<CorsLayer> {
    let Some(origins) = allowed_origins else {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    };

    let origins = origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .with_context(|| format!("Invalid CORS origin: {}", origin))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Starting relay...");

    let Config {
        bind_address,
        elevenlabs_api_key,
        elevenlabs_ws_url,
        lifecycle,
        cors_allowed_origins,
        ..
    } = config;

    // --- 3. Start the Relay ---
    let connector = Arc::new(ElevenLabsConnector::new(
        elevenlabs_ws_url.clone(),
        elevenlabs_api_key,
    ));
    let (relay, relay_task) = Relay::spawn(connector, lifecycle);
    let app_state = Arc::new(AppState::new(relay));

    // --- 4. Create Router and Apply Middleware ---
    let cors = cors_layer(cors_allowed_origins.as_deref())?;
    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        upstream = %elevenlabs_ws_url,
        bind_address = %bind_address,
        sweep_interval = ?lifecycle.sweep_interval,
        idle_timeout = ?lifecycle.idle_timeout,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    relay_task.abort();
    info!("Server has shut down.");
    Ok(())
}
