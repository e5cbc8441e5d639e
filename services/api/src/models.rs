//! API Models
//!
//! Request and response bodies of the REST API, with `utoipa` schemas for the
//! OpenAPI document. Core types that already serialize the right way are
//! wrapped rather than duplicated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;
use voicebot_core::knowledge::DocumentInfo;

use crate::ws::registry::SessionInfo;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct HealthChecks {
    /// Whether an OpenAI API key is configured.
    pub openai: bool,
    pub knowledge_base: bool,
    /// Number of active catalog endpoints.
    pub endpoints: usize,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    #[schema(example = "healthy")]
    pub status: String,
    pub active_sessions: usize,
    pub timestamp: DateTime<Utc>,
    pub checks: HealthChecks,
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct SessionList {
    pub count: usize,
    pub sessions: Vec<SessionInfo>,
}

/// The endpoint catalog as stored on disk. Credentials are masked on read.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct CatalogPayload {
    #[schema(value_type = Vec<Object>)]
    pub endpoints: Vec<Value>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct CatalogUpdated {
    #[schema(example = "success")]
    pub status: String,
    pub endpoints: usize,
}

/// A direct call through the external API bridge.
#[derive(Deserialize, ToSchema, Debug, Clone)]
pub struct CallApiPayload {
    #[schema(example = "weather")]
    pub endpoint: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub params: Map<String, Value>,
}

#[derive(Deserialize, ToSchema, Debug, Clone)]
pub struct DocumentPayload {
    #[schema(example = "refund_policy.txt")]
    pub file_name: String,
    pub content: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct DocumentIndexed {
    pub file_id: String,
    pub file_name: String,
    pub chunks: usize,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct DocumentSummary {
    pub file_id: String,
    pub file_name: String,
    pub chunks: usize,
    pub indexed_at: DateTime<Utc>,
}

impl From<DocumentInfo> for DocumentSummary {
    fn from(info: DocumentInfo) -> Self {
        Self {
            file_id: info.file_id,
            file_name: info.file_name,
            chunks: info.chunks,
            indexed_at: info.indexed_at,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct DocumentList {
    pub count: usize,
    pub files: Vec<DocumentSummary>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct DocumentRemoved {
    #[schema(example = "success")]
    pub status: String,
    pub file_id: String,
    pub chunks_removed: usize,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_payload_defaults() {
        let payload: CallApiPayload = serde_json::from_str(r#"{"endpoint":"dad_jokes"}"#).unwrap();
        assert_eq!(payload.endpoint, "dad_jokes");
        assert_eq!(payload.method, None);
        assert!(payload.params.is_empty());
    }

    #[test]
    fn test_document_payload_requires_content() {
        let result: Result<DocumentPayload, _> =
            serde_json::from_str(r#"{"file_name":"notes.txt"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_document_summary_from_info() {
        let now = Utc::now();
        let summary = DocumentSummary::from(DocumentInfo {
            file_id: "f1".into(),
            file_name: "notes.txt".into(),
            chunks: 3,
            indexed_at: now,
        });
        assert_eq!(summary.chunks, 3);
        assert_eq!(summary.indexed_at, now);
    }

    #[test]
    fn test_error_response_serialization() {
        let error = ErrorResponse {
            message: "Document not found".to_string(),
        };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json, json!({ "message": "Document not found" }));
    }
}
