//! Capability Provider Interface
//!
//! A capability is a named side effect the conversational model may request
//! while a turn is in progress. Every provider implements the same async
//! contract and is driven through a [`CapabilitySet`], which bounds execution
//! time and converts every fault into a [`CapabilityResult::Failure`] so a
//! failing provider can never take the calling session down with it.

use crate::knowledge::KnowledgeError;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

/// Default bound for a single capability invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Typed failures raised by providers before they are flattened into a
/// [`CapabilityResult::Failure`].
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("Unknown endpoint '{0}'")]
    UnknownEndpoint(String),
    #[error("API returned status {status} for endpoint '{endpoint}'")]
    Status { endpoint: String, status: u16 },
    #[error("Invalid JSON response from endpoint '{endpoint}': {reason}")]
    Decode { endpoint: String, reason: String },
    #[error("Request to endpoint '{endpoint}' failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Knowledge(#[from] KnowledgeError),
}

/// What a provider advertises to the model: a name, a natural-language
/// description and a JSON schema for its arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The outcome of one capability call.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityResult {
    Success(Value),
    Failure(String),
}

impl CapabilityResult {
    pub fn timeout() -> Self {
        Self::Failure("timeout".to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The result as a JSON value, with failures rendered as an error object.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Success(value) => value.clone(),
            Self::Failure(reason) => json!({ "status": "error", "error": reason }),
        }
    }

    /// The single string handed back to the model as the function output.
    ///
    /// Image-bearing payloads are reshaped into an envelope the model can
    /// narrate instead of a raw response body.
    pub fn to_output_string(&self) -> String {
        let value = match self {
            Self::Success(payload) => image_envelope(payload).unwrap_or_else(|| payload.clone()),
            Self::Failure(_) => self.to_value(),
        };
        value.to_string()
    }
}

fn image_envelope(payload: &Value) -> Option<Value> {
    if payload.get("response_type").and_then(Value::as_str) != Some("image") {
        return None;
    }
    let response = payload.get("response")?;
    let url = response.get("image_url").and_then(Value::as_str)?;
    let description = response
        .get("description")
        .and_then(Value::as_str)
        .filter(|d| !d.is_empty())
        .unwrap_or("Image retrieved successfully");
    let source = payload
        .get("endpoint")
        .and_then(Value::as_str)
        .unwrap_or("the image service");

    Some(json!({
        "type": "image",
        "url": url,
        "description": description,
        "note": format!(
            "I've retrieved an image from {source}. The image shows: {description}. The image URL is: {url}"
        ),
    }))
}

/// The uniform contract every capability implements.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// The name the model uses to call this capability.
    fn name(&self) -> &str;

    /// Declaration sent to the model during the session handshake.
    fn declaration(&self) -> CapabilityDeclaration;

    /// Per-call bound. `None` defers to the owning set's default.
    fn timeout(&self, _arguments: &Value) -> Option<Duration> {
        None
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, CapabilityError>;
}

/// An ordered set of providers with timeout and fault containment.
#[derive(Clone)]
pub struct CapabilitySet {
    providers: Vec<Arc<dyn CapabilityProvider>>,
    default_timeout: Duration,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl std::fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilitySet")
            .field("providers", &self.names())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl CapabilitySet {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            providers: Vec::new(),
            default_timeout,
        }
    }

    /// Adds a provider, replacing any existing one with the same name.
    pub fn register(&mut self, provider: Arc<dyn CapabilityProvider>) {
        match self.providers.iter().position(|p| p.name() == provider.name()) {
            Some(idx) => self.providers[idx] = provider,
            None => self.providers.push(provider),
        }
    }

    pub fn with(mut self, provider: Arc<dyn CapabilityProvider>) -> Self {
        self.register(provider);
        self
    }

    /// A new set holding only the named providers, in this set's order.
    pub fn subset(&self, names: &[&str]) -> Self {
        Self {
            providers: self
                .providers
                .iter()
                .filter(|p| names.contains(&p.name()))
                .cloned()
                .collect(),
            default_timeout: self.default_timeout,
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn declarations(&self) -> Vec<CapabilityDeclaration> {
        self.providers.iter().map(|p| p.declaration()).collect()
    }

    fn get(&self, name: &str) -> Option<&Arc<dyn CapabilityProvider>> {
        self.providers.iter().find(|p| p.name() == name)
    }

    /// Runs a capability to completion or to its bound.
    ///
    /// The provider runs on its own task so a panic surfaces as a join error
    /// instead of unwinding through the caller. A call that outlives its bound
    /// is aborted and reported as `Failure("timeout")`.
    pub async fn invoke(&self, name: &str, arguments: Value) -> CapabilityResult {
        let Some(provider) = self.get(name).cloned() else {
            warn!(capability = %name, "Model requested an unknown capability");
            return CapabilityResult::Failure(format!("Unknown capability: {name}"));
        };

        let limit = provider.timeout(&arguments).unwrap_or(self.default_timeout);
        let started = Instant::now();
        debug!(capability = %name, ?limit, "Invoking capability");

        let mut handle = tokio::spawn(async move { provider.invoke(arguments).await });
        let result = match timeout(limit, &mut handle).await {
            Ok(Ok(Ok(value))) => CapabilityResult::Success(value),
            Ok(Ok(Err(e))) => {
                warn!(capability = %name, error = %e, "Capability failed");
                CapabilityResult::Failure(e.to_string())
            }
            Ok(Err(join_err)) => {
                error!(capability = %name, error = %join_err, "Capability task aborted");
                CapabilityResult::Failure(format!("Capability '{name}' failed unexpectedly"))
            }
            Err(_) => {
                handle.abort();
                warn!(capability = %name, ?limit, "Capability timed out");
                CapabilityResult::timeout()
            }
        };

        info!(
            capability = %name,
            success = result.is_success(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Capability finished"
        );
        result
    }
}

/// JSON schema for an argument struct, trimmed to what a tool declaration
/// expects.
pub fn parameters_schema<T: JsonSchema>() -> Value {
    let mut value = serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| json!({ "type": "object" }));
    if let Some(object) = value.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    value
}

/// Restricts a string property of an object schema to the given values.
pub fn restrict_to(schema: &mut Value, property: &str, values: &[String]) {
    if let Some(slot) = schema
        .get_mut("properties")
        .and_then(|p| p.get_mut(property))
        .and_then(Value::as_object_mut)
    {
        slot.insert("enum".to_string(), json!(values));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    struct Echo;

    #[async_trait]
    impl CapabilityProvider for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn declaration(&self) -> CapabilityDeclaration {
            CapabilityDeclaration {
                name: "echo".into(),
                description: "Echoes its arguments".into(),
                parameters: json!({ "type": "object" }),
            }
        }

        async fn invoke(&self, arguments: Value) -> Result<Value, CapabilityError> {
            Ok(arguments)
        }
    }

    struct Stalls;

    #[async_trait]
    impl CapabilityProvider for Stalls {
        fn name(&self) -> &str {
            "stalls"
        }

        fn declaration(&self) -> CapabilityDeclaration {
            CapabilityDeclaration {
                name: "stalls".into(),
                description: String::new(),
                parameters: json!({}),
            }
        }

        fn timeout(&self, _arguments: &Value) -> Option<Duration> {
            Some(Duration::from_millis(50))
        }

        async fn invoke(&self, _arguments: Value) -> Result<Value, CapabilityError> {
            std::future::pending().await
        }
    }

    struct Panics;

    #[async_trait]
    impl CapabilityProvider for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        fn declaration(&self) -> CapabilityDeclaration {
            CapabilityDeclaration {
                name: "panics".into(),
                description: String::new(),
                parameters: json!({}),
            }
        }

        async fn invoke(&self, _arguments: Value) -> Result<Value, CapabilityError> {
            panic!("provider blew up");
        }
    }

    struct Rejects;

    #[async_trait]
    impl CapabilityProvider for Rejects {
        fn name(&self) -> &str {
            "rejects"
        }

        fn declaration(&self) -> CapabilityDeclaration {
            CapabilityDeclaration {
                name: "rejects".into(),
                description: String::new(),
                parameters: json!({}),
            }
        }

        async fn invoke(&self, _arguments: Value) -> Result<Value, CapabilityError> {
            Err(CapabilityError::Status {
                endpoint: "weather".into(),
                status: 503,
            })
        }
    }

    fn set() -> CapabilitySet {
        CapabilitySet::default()
            .with(Arc::new(Echo))
            .with(Arc::new(Stalls))
            .with(Arc::new(Panics))
            .with(Arc::new(Rejects))
    }

    #[tokio::test]
    async fn success_passes_payload_through() {
        let result = set().invoke("echo", json!({ "a": 1 })).await;
        assert_eq!(result, CapabilityResult::Success(json!({ "a": 1 })));
    }

    #[tokio::test]
    async fn provider_that_never_returns_times_out() {
        let started = std::time::Instant::now();
        let result = set().invoke("stalls", json!({})).await;
        assert_eq!(result, CapabilityResult::timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn panic_becomes_failure() {
        let result = set().invoke("panics", json!({})).await;
        match result {
            CapabilityResult::Failure(reason) => assert!(reason.contains("panics")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn typed_error_message_is_kept() {
        let result = set().invoke("rejects", json!({})).await;
        assert_eq!(
            result,
            CapabilityResult::Failure("API returned status 503 for endpoint 'weather'".into())
        );
    }

    #[tokio::test]
    async fn unknown_capability_is_a_failure() {
        let result = set().invoke("teleport", json!({})).await;
        assert_eq!(
            result,
            CapabilityResult::Failure("Unknown capability: teleport".into())
        );
    }

    #[test]
    fn register_replaces_same_name() {
        let mut set = set();
        set.register(Arc::new(Echo));
        assert_eq!(set.len(), 4);
        assert_eq!(set.names(), vec!["echo", "stalls", "panics", "rejects"]);
    }

    #[test]
    fn subset_keeps_declaration_order() {
        let subset = set().subset(&["rejects", "echo"]);
        assert_eq!(subset.names(), vec!["echo", "rejects"]);
        assert!(!subset.contains("panics"));
    }

    #[test]
    fn failure_output_is_error_object() {
        let output = CapabilityResult::Failure("timeout".into()).to_output_string();
        let value: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value, json!({ "status": "error", "error": "timeout" }));
    }

    #[test]
    fn image_payload_is_reshaped() {
        let payload = json!({
            "endpoint": "dog",
            "status": "success",
            "response_type": "image",
            "response": { "image_url": "http://x/img.png", "description": "Here's a random dog picture!" }
        });
        let output = CapabilityResult::Success(payload).to_output_string();
        let value: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["type"], "image");
        assert_eq!(value["url"], "http://x/img.png");
        assert_eq!(value["description"], "Here's a random dog picture!");
        assert!(value["note"].as_str().unwrap().contains("from dog"));
    }

    #[test]
    fn plain_payload_is_not_reshaped() {
        let payload = json!({ "response": { "image_url": "http://x/img.png" } });
        let output = CapabilityResult::Success(payload.clone()).to_output_string();
        assert_eq!(serde_json::from_str::<Value>(&output).unwrap(), payload);
    }

    #[derive(Deserialize, JsonSchema)]
    #[allow(dead_code)]
    struct Args {
        /// Which thing.
        kind: String,
        #[serde(default)]
        count: u32,
    }

    #[test]
    fn schema_is_trimmed_and_restrictable() {
        let mut schema = parameters_schema::<Args>();
        assert!(schema.get("$schema").is_none());
        assert!(schema.get("title").is_none());
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["kind"]));

        restrict_to(&mut schema, "kind", &["a".to_string(), "b".to_string()]);
        assert_eq!(schema["properties"]["kind"]["enum"], json!(["a", "b"]));
    }
}
