//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, the three WebSocket relay routes, and OpenAPI
//! documentation.

use crate::{
    handlers,
    models::{
        CallApiPayload, CatalogPayload, CatalogUpdated, DocumentIndexed, DocumentList,
        DocumentPayload, DocumentRemoved, DocumentSummary, ErrorResponse, HealthChecks,
        HealthResponse, SessionList,
    },
    profile::ProfileKind,
    state::AppState,
    ws::{
        assistant_ws, realtime_ws,
        registry::{SessionInfo, SessionPhase},
        rtc_ws,
    },
};

use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::list_sessions,
        handlers::get_endpoints,
        handlers::update_endpoints,
        handlers::call_api,
        handlers::index_document,
        handlers::list_documents,
        handlers::delete_document,
    ),
    components(
        schemas(
            HealthResponse, HealthChecks, SessionList, SessionInfo, SessionPhase, ProfileKind,
            CatalogPayload, CatalogUpdated, CallApiPayload, DocumentPayload, DocumentIndexed,
            DocumentSummary, DocumentList, DocumentRemoved, ErrorResponse
        )
    ),
    tags(
        (name = "Voicebot API", description = "Realtime voice relay with knowledge base, external APIs and workflows")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/sessions", get(handlers::list_sessions))
        .route(
            "/api/endpoints",
            get(handlers::get_endpoints).post(handlers::update_endpoints),
        )
        .route("/api/call", post(handlers::call_api))
        .route("/api/documents", post(handlers::index_document))
        .route("/api/rag/files", get(handlers::list_documents))
        .route("/api/file/{file_id}", delete(handlers::delete_document))
        .route("/ws", get(assistant_ws))
        .route("/realtime", get(realtime_ws))
        .route("/rtc", get(rtc_ws))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    // Merge the stateful routes with the stateless Swagger UI.
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
