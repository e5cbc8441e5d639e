//! Axum Handlers for the REST API
//!
//! Health, session listing, endpoint catalog management, direct API calls and
//! knowledge base documents. It uses `utoipa` doc comments to generate
//! OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;
use voicebot_core::{
    CapabilityError,
    external_api::{CatalogError, CatalogFile},
    knowledge::KnowledgeError,
};

use crate::{
    models::{
        CallApiPayload, CatalogPayload, CatalogUpdated, DocumentIndexed, DocumentList,
        DocumentPayload, DocumentRemoved, DocumentSummary, ErrorResponse, HealthChecks,
        HealthResponse, SessionList,
    },
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    BadGateway(String),
    ServiceUnavailable(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::BadGateway(message) => {
                (StatusCode::BAD_GATEWAY, Json(ErrorResponse { message })).into_response()
            }
            ApiError::ServiceUnavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn catalog_error(err: CatalogError) -> ApiError {
    match err {
        CatalogError::DuplicateId(_) | CatalogError::InvalidUrl { .. } | CatalogError::Parse(_) => {
            ApiError::BadRequest(err.to_string())
        }
        other => ApiError::InternalServerError(other.into()),
    }
}

fn knowledge_error(err: KnowledgeError) -> ApiError {
    match err {
        KnowledgeError::Unavailable => ApiError::ServiceUnavailable(err.to_string()),
        KnowledgeError::DocumentNotFound(_) => ApiError::NotFound(err.to_string()),
        KnowledgeError::EmptyDocument(_) => ApiError::BadRequest(err.to_string()),
    }
}

fn capability_error(err: CapabilityError) -> ApiError {
    match err {
        CapabilityError::UnknownEndpoint(_) => ApiError::NotFound(err.to_string()),
        CapabilityError::InvalidArguments(_) => ApiError::BadRequest(err.to_string()),
        CapabilityError::Unavailable(_) => ApiError::ServiceUnavailable(err.to_string()),
        CapabilityError::Knowledge(inner) => knowledge_error(inner),
        other => ApiError::BadGateway(other.to_string()),
    }
}

/// Service health and readiness of its collaborators.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        active_sessions: state.registry.len().await,
        timestamp: Utc::now(),
        checks: HealthChecks {
            openai: state.config.openai_api_key.is_some(),
            knowledge_base: state.knowledge.is_ready(),
            endpoints: state.catalog.active_ids().len(),
        },
    })
}

/// List live relay sessions.
#[utoipa::path(
    get,
    path = "/api/sessions",
    responses(
        (status = 200, description = "Live sessions", body = SessionList)
    )
)]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionList> {
    let sessions = state.registry.list().await;
    Json(SessionList {
        count: sessions.len(),
        sessions,
    })
}

/// Read the endpoint catalog. API keys are masked.
#[utoipa::path(
    get,
    path = "/api/endpoints",
    responses(
        (status = 200, description = "Endpoint catalog", body = CatalogPayload)
    )
)]
pub async fn get_endpoints(State(state): State<Arc<AppState>>) -> Json<CatalogFile> {
    Json(state.catalog.redacted())
}

/// Replace the endpoint catalog and persist it. New sessions see the change;
/// live sessions keep the tool declarations they were configured with.
#[utoipa::path(
    post,
    path = "/api/endpoints",
    request_body = CatalogPayload,
    responses(
        (status = 200, description = "Catalog replaced", body = CatalogUpdated),
        (status = 400, description = "Invalid catalog", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn update_endpoints(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CatalogFile>,
) -> Result<Json<CatalogUpdated>, ApiError> {
    let endpoints = state.catalog.replace(payload).await.map_err(catalog_error)?;
    Ok(Json(CatalogUpdated {
        status: "success".to_string(),
        endpoints,
    }))
}

/// Call a catalog endpoint directly through the external API bridge.
#[utoipa::path(
    post,
    path = "/api/call",
    request_body = CallApiPayload,
    responses(
        (status = 200, description = "Endpoint response envelope"),
        (status = 400, description = "Invalid arguments", body = ErrorResponse),
        (status = 404, description = "Unknown or inactive endpoint", body = ErrorResponse),
        (status = 502, description = "Endpoint failed", body = ErrorResponse),
        (status = 503, description = "Endpoint not configured", body = ErrorResponse)
    )
)]
pub async fn call_api(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CallApiPayload>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let value = state
        .bridge
        .call(&payload.endpoint, payload.method.as_deref(), &payload.params)
        .await
        .map_err(capability_error)?;
    Ok(Json(value))
}

/// Add a text document to the knowledge base.
#[utoipa::path(
    post,
    path = "/api/documents",
    request_body = DocumentPayload,
    responses(
        (status = 201, description = "Document indexed", body = DocumentIndexed),
        (status = 400, description = "Empty document", body = ErrorResponse),
        (status = 503, description = "Knowledge base unavailable", body = ErrorResponse)
    )
)]
pub async fn index_document(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<DocumentPayload>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.file_name.trim().is_empty() {
        return Err(ApiError::BadRequest("file_name must not be empty".to_string()));
    }
    let file_id = Uuid::new_v4().to_string();
    let chunks = state
        .knowledge
        .index_document(&file_id, &payload.file_name, &payload.content)
        .await
        .map_err(knowledge_error)?;
    info!(%file_id, file_name = %payload.file_name, chunks, "Document uploaded");

    Ok((
        StatusCode::CREATED,
        Json(DocumentIndexed {
            file_id,
            file_name: payload.file_name,
            chunks,
        }),
    ))
}

/// List indexed documents.
#[utoipa::path(
    get,
    path = "/api/rag/files",
    responses(
        (status = 200, description = "Indexed documents", body = DocumentList)
    )
)]
pub async fn list_documents(State(state): State<Arc<AppState>>) -> Json<DocumentList> {
    let files: Vec<DocumentSummary> = state
        .knowledge
        .list_documents()
        .await
        .into_iter()
        .map(DocumentSummary::from)
        .collect();
    Json(DocumentList {
        count: files.len(),
        files,
    })
}

/// Remove a document and all of its chunks.
#[utoipa::path(
    delete,
    path = "/api/file/{file_id}",
    responses(
        (status = 200, description = "Document removed", body = DocumentRemoved),
        (status = 404, description = "Document not found", body = ErrorResponse)
    ),
    params(
        ("file_id" = String, Path, description = "Document ID returned on upload")
    )
)]
pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
) -> Result<Json<DocumentRemoved>, ApiError> {
    let chunks_removed = state
        .knowledge
        .remove_document(&file_id)
        .await
        .map_err(knowledge_error)?;
    Ok(Json(DocumentRemoved {
        status: "success".to_string(),
        file_id,
        chunks_removed,
    }))
}
