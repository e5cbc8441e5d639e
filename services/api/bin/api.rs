//! Main Entrypoint for the Voicebot API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Loading the endpoint catalog and creating the knowledge base.
//! 3. Constructing the Axum router and applying middleware.
//! 4. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use voicebot_api::{
    config::Config, router::create_router, state::AppState, ws::provider::openai::OpenAiConnector,
};
use voicebot_core::{external_api::EndpointCatalog, knowledge::KnowledgeBase};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
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
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared Services ---
    let catalog = EndpointCatalog::load(&config.api_config_path).with_context(|| {
        format!(
            "Failed to load endpoint catalog from {}",
            config.api_config_path.display()
        )
    })?;
    info!(
        endpoints = catalog.len(),
        path = %config.api_config_path.display(),
        "Endpoint catalog loaded"
    );

    let connector = OpenAiConnector::from_config(&config);
    if !connector.is_configured() {
        warn!("OPENAI_API_KEY is not set; voice sessions will fail to connect");
    }

    let app_state = Arc::new(AppState::new(
        config.clone(),
        catalog,
        KnowledgeBase::in_memory(),
        Arc::new(connector),
    ));

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        model = %config.realtime_model,
        server_vad = config.server_vad,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
