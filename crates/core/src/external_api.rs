//! External API bridge.
//!
//! Third-party REST APIs are described declaratively by an [`EndpointSpec`]
//! (URL template, auth mode, headers, body template) held in an
//! [`EndpointCatalog`]. The [`ExternalApiBridge`] resolves an endpoint id,
//! performs the HTTP call and wraps the decoded body in a uniform envelope.

use crate::capability::{
    CapabilityDeclaration, CapabilityError, CapabilityProvider, parameters_schema, restrict_to,
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard},
    time::Duration,
};
use tracing::{debug, info, warn};
use url::Url;

pub const EXTERNAL_API_CAPABILITY: &str = "call_external_api";

const REDACTED: &str = "********";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to read endpoint catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write endpoint catalog {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed endpoint catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Duplicate endpoint id '{0}'")]
    DuplicateId(String),
    #[error("Endpoint '{id}' has an invalid URL template: {reason}")]
    InvalidUrl { id: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Header,
    Query,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Json,
    Image,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_auth_param() -> String {
    "Authorization".to_string()
}

fn default_image_field() -> String {
    "message".to_string()
}

fn default_true() -> bool {
    true
}

/// Declarative description of one third-party endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub id: String,
    #[serde(default)]
    pub description: String,
    /// URL template; `{name}` placeholders are filled from `params`.
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Parameters substituted into URL placeholders.
    #[serde(default)]
    pub params: Vec<String>,
    /// Parameters appended to the query string when present.
    #[serde(default)]
    pub query_params: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default = "default_auth_param")]
    pub auth_param: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// JSON body for non-GET calls; string values of the form `{name}` are
    /// replaced by the matching parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_template: Option<Map<String, Value>>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    #[serde(default)]
    pub response_type: ResponseType,
    /// Field of an image response that carries the image URL.
    #[serde(default = "default_image_field")]
    pub image_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl EndpointSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            url: url.into(),
            method: default_method(),
            params: Vec::new(),
            query_params: Vec::new(),
            headers: BTreeMap::new(),
            auth_type: AuthType::None,
            auth_param: default_auth_param(),
            api_key: None,
            body_template: None,
            active: true,
            example: None,
            response_type: ResponseType::Json,
            image_field: default_image_field(),
            image_description: None,
            timeout_secs: None,
        }
    }

    fn with_params(mut self, params: &[&str]) -> Self {
        self.params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    fn with_example(mut self, example: &str) -> Self {
        self.example = Some(example.to_string());
        self
    }

    fn as_image(mut self, description: &str) -> Self {
        self.response_type = ResponseType::Image;
        self.image_description = Some(description.to_string());
        self
    }

    /// The key to attach, if this endpoint authenticates at all.
    fn credential(&self) -> Result<Option<&str>, CapabilityError> {
        if self.auth_type == AuthType::None {
            return Ok(None);
        }
        match self.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() && !key.starts_with("your_") => Ok(Some(key)),
            _ => Err(CapabilityError::Unavailable(format!(
                "The '{}' service is not available: no API key is configured",
                self.id
            ))),
        }
    }

    fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.api_key.is_some() {
            copy.api_key = Some(REDACTED.to_string());
        }
        copy
    }
}

/// The on-disk catalog format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
}

impl CatalogFile {
    fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if !seen.insert(endpoint.id.as_str()) {
                return Err(CatalogError::DuplicateId(endpoint.id.clone()));
            }
            let probe = endpoint
                .params
                .iter()
                .fold(endpoint.url.clone(), |url, p| url.replace(&format!("{{{p}}}"), "x"));
            Url::parse(&probe).map_err(|e| CatalogError::InvalidUrl {
                id: endpoint.id.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Endpoints available when no catalog file exists.
pub fn builtin_endpoints() -> Vec<EndpointSpec> {
    vec![
        EndpointSpec::new(
            "weather",
            "Current weather conditions and forecast for a city",
            "https://wttr.in/{city}?format=j1",
        )
        .with_params(&["city"])
        .with_example("What's the weather like in London?"),
        EndpointSpec::new("dad_jokes", "A random dad joke", "https://icanhazdadjoke.com/")
            .with_header("Accept", "application/json")
            .with_example("Tell me a joke"),
        EndpointSpec::new(
            "fun_fact",
            "A random fun fact",
            "https://uselessfacts.jsph.pl/api/v2/facts/random?language=en",
        )
        .with_example("Tell me something interesting"),
        EndpointSpec::new("advice", "A random piece of advice", "https://api.adviceslip.com/advice"),
        EndpointSpec::new("dog", "A random dog picture", "https://dog.ceo/api/breeds/image/random")
            .as_image("Here's a random dog picture!")
            .with_example("Show me a dog"),
        EndpointSpec::new("affirmation", "An encouraging affirmation", "https://www.affirmations.dev/")
            .with_example("I need encouragement"),
        EndpointSpec::new("kanye", "A random Kanye West quote", "https://api.kanye.rest/"),
        EndpointSpec::new(
            "trivia",
            "A random trivia question",
            "https://the-trivia-api.com/v2/questions?limit=1",
        ),
    ]
}

/// The live set of endpoint descriptions, optionally backed by a file.
#[derive(Debug)]
pub struct EndpointCatalog {
    endpoints: RwLock<Vec<EndpointSpec>>,
    path: Option<PathBuf>,
}

impl Default for EndpointCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl EndpointCatalog {
    pub fn builtin() -> Self {
        Self {
            endpoints: RwLock::new(builtin_endpoints()),
            path: None,
        }
    }

    pub fn from_file(file: CatalogFile, path: Option<PathBuf>) -> Result<Self, CatalogError> {
        file.validate()?;
        Ok(Self {
            endpoints: RwLock::new(file.endpoints),
            path,
        })
    }

    /// Loads the catalog at `path`, falling back to the built-in endpoints
    /// when the file does not exist. Replacements are written back to `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            info!(path = %path.display(), "No endpoint catalog found, using built-in endpoints");
            return Ok(Self {
                endpoints: RwLock::new(builtin_endpoints()),
                path: Some(path),
            });
        }

        let raw = std::fs::read_to_string(&path).map_err(|source| CatalogError::Read {
            path: path.clone(),
            source,
        })?;
        let file: CatalogFile = serde_json::from_str(&raw)?;
        info!(path = %path.display(), endpoints = file.endpoints.len(), "Loaded endpoint catalog");
        Self::from_file(file, Some(path))
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<EndpointSpec>> {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> CatalogFile {
        CatalogFile {
            endpoints: self.read().clone(),
        }
    }

    /// Like [`snapshot`](Self::snapshot) with API keys masked.
    pub fn redacted(&self) -> CatalogFile {
        CatalogFile {
            endpoints: self.read().iter().map(EndpointSpec::redacted).collect(),
        }
    }

    pub fn get_active(&self, id: &str) -> Option<EndpointSpec> {
        self.read().iter().find(|e| e.id == id && e.active).cloned()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.read()
            .iter()
            .filter(|e| e.active)
            .map(|e| e.id.clone())
            .collect()
    }

    /// Instruction text listing the active endpoints, empty when none are.
    pub fn instructions(&self) -> String {
        let endpoints = self.read();
        let lines: Vec<String> = endpoints
            .iter()
            .filter(|e| e.active)
            .map(|e| match &e.example {
                Some(example) => format!("- {}: {}\n  Example: \"{}\"", e.id, e.description, example),
                None => format!("- {}: {}", e.id, e.description),
            })
            .collect();
        if lines.is_empty() {
            return String::new();
        }
        format!("Configured API endpoints:\n{}", lines.join("\n"))
    }

    /// Validates, persists and swaps in a new catalog. Returns the number of
    /// endpoints now configured.
    pub async fn replace(&self, file: CatalogFile) -> Result<usize, CatalogError> {
        file.validate()?;

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| CatalogError::Write {
                        path: path.clone(),
                        source,
                    })?;
            }
            let json = serde_json::to_string_pretty(&file)?;
            tokio::fs::write(path, json)
                .await
                .map_err(|source| CatalogError::Write {
                    path: path.clone(),
                    source,
                })?;
        }

        let count = file.endpoints.len();
        *self.endpoints.write().unwrap_or_else(PoisonError::into_inner) = file.endpoints;
        info!(endpoints = count, "Endpoint catalog replaced");
        Ok(count)
    }
}

fn param_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn encode_path_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn build_url(
    spec: &EndpointSpec,
    params: &Map<String, Value>,
    credential: Option<&str>,
) -> Result<Url, CapabilityError> {
    let mut raw = spec.url.clone();
    for name in &spec.params {
        let value = params.get(name).map(param_text).ok_or_else(|| {
            CapabilityError::InvalidArguments(format!(
                "Missing parameter '{name}' for endpoint '{}'",
                spec.id
            ))
        })?;
        raw = raw.replace(&format!("{{{name}}}"), &encode_path_segment(&value));
    }

    let mut url = Url::parse(&raw).map_err(|e| {
        CapabilityError::InvalidArguments(format!("Endpoint '{}' has an invalid URL: {e}", spec.id))
    })?;

    let mut pairs: Vec<(String, String)> = spec
        .query_params
        .iter()
        .filter_map(|name| params.get(name).map(|v| (name.clone(), param_text(v))))
        .collect();
    if let (AuthType::Query, Some(key)) = (spec.auth_type, credential) {
        pairs.push((spec.auth_param.clone(), key.to_string()));
    }
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }
    Ok(url)
}

fn render_body(spec: &EndpointSpec, params: &Map<String, Value>) -> Value {
    let Some(template) = &spec.body_template else {
        return Value::Object(params.clone());
    };
    let body = template
        .iter()
        .map(|(key, value)| {
            let filled = value
                .as_str()
                .and_then(|s| s.strip_prefix('{')?.strip_suffix('}'))
                .and_then(|name| params.get(name))
                .cloned()
                .unwrap_or_else(|| value.clone());
            (key.clone(), filled)
        })
        .collect();
    Value::Object(body)
}

/// Performs catalog-described HTTP calls.
#[derive(Clone)]
pub struct ExternalApiBridge {
    catalog: Arc<EndpointCatalog>,
    http: reqwest::Client,
    timeout: Option<Duration>,
}

impl ExternalApiBridge {
    pub fn new(catalog: Arc<EndpointCatalog>) -> Self {
        Self {
            catalog,
            http: reqwest::Client::new(),
            timeout: None,
        }
    }

    /// Bound for endpoints that do not set `timeout_secs`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn catalog(&self) -> &Arc<EndpointCatalog> {
        &self.catalog
    }

    /// Calls `endpoint`, using its configured method unless `method` is given.
    pub async fn call(
        &self,
        endpoint: &str,
        method: Option<&str>,
        params: &Map<String, Value>,
    ) -> Result<Value, CapabilityError> {
        let spec = self
            .catalog
            .get_active(endpoint)
            .ok_or_else(|| CapabilityError::UnknownEndpoint(endpoint.to_string()))?;
        let credential = spec.credential()?;

        let method_name = method.unwrap_or(spec.method.as_str()).to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes()).map_err(|_| {
            CapabilityError::InvalidArguments(format!("Unsupported HTTP method '{method_name}'"))
        })?;

        let url = build_url(&spec, params, credential)?;
        debug!(%endpoint, %method, %url, "Calling external API");

        let mut request = self.http.request(method.clone(), url);
        for (name, value) in &spec.headers {
            request = request.header(name, value);
        }
        if let (AuthType::Header, Some(key)) = (spec.auth_type, credential) {
            let value = if spec.auth_param.eq_ignore_ascii_case("authorization") {
                format!("Bearer {key}")
            } else {
                key.to_string()
            };
            request = request.header(spec.auth_param.as_str(), value);
        }
        if method != Method::GET {
            request = request.json(&render_body(&spec, params));
        }
        if let Some(secs) = spec.timeout_secs {
            request = request.timeout(Duration::from_secs(secs));
        }

        let response = request.send().await.map_err(|source| CapabilityError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(%endpoint, status = status.as_u16(), "External API returned an error status");
            return Err(CapabilityError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let text = response.text().await.map_err(|source| CapabilityError::Http {
            endpoint: endpoint.to_string(),
            source,
        })?;
        let data: Value = serde_json::from_str(&text).map_err(|e| CapabilityError::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        let mut envelope = json!({
            "endpoint": endpoint,
            "method": method.as_str(),
            "status": "success",
            "timestamp": Utc::now().to_rfc3339(),
        });

        let image_url = (spec.response_type == ResponseType::Image)
            .then(|| data.get(&spec.image_field).and_then(Value::as_str))
            .flatten()
            .map(str::to_owned);
        match image_url {
            Some(image_url) => {
                envelope["response"] = json!({
                    "image_url": image_url,
                    "description": spec
                        .image_description
                        .as_deref()
                        .unwrap_or("Image retrieved successfully"),
                    "status": data.get("status").and_then(Value::as_str).unwrap_or("success"),
                });
                envelope["response_type"] = json!("image");
            }
            None => envelope["response"] = data,
        }

        info!(%endpoint, "External API call succeeded");
        Ok(envelope)
    }
}

/// Arguments of `call_external_api`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExternalApiArgs {
    /// API endpoint name
    pub endpoint: String,
    /// HTTP method; defaults to the endpoint's configured method
    #[serde(default)]
    pub method: Option<String>,
    /// API parameters
    #[serde(default)]
    pub params: Map<String, Value>,
}

pub struct ExternalApiCapability {
    bridge: ExternalApiBridge,
}

impl ExternalApiCapability {
    pub fn new(bridge: ExternalApiBridge) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl CapabilityProvider for ExternalApiCapability {
    fn name(&self) -> &str {
        EXTERNAL_API_CAPABILITY
    }

    fn declaration(&self) -> CapabilityDeclaration {
        let ids = self.bridge.catalog.active_ids();
        let mut parameters = parameters_schema::<ExternalApiArgs>();
        if !ids.is_empty() {
            restrict_to(&mut parameters, "endpoint", &ids);
        }
        if let Some(properties) = parameters.get_mut("properties").and_then(Value::as_object_mut) {
            properties.insert(
                "method".to_string(),
                json!({ "type": "string", "enum": ["GET", "POST", "PUT", "DELETE"], "default": "GET" }),
            );
        }

        let param_hints: Vec<String> = self
            .bridge
            .catalog
            .read()
            .iter()
            .filter(|e| e.active && !(e.params.is_empty() && e.query_params.is_empty()))
            .map(|e| {
                let names: Vec<&str> = e
                    .params
                    .iter()
                    .chain(&e.query_params)
                    .map(String::as_str)
                    .collect();
                format!("{}: {}", e.id, names.join(", "))
            })
            .collect();

        let mut description = format!(
            "Call an external API endpoint. Valid endpoints: {}.",
            ids.join(", ")
        );
        if !param_hints.is_empty() {
            description.push_str(&format!(
                " Pass endpoint parameters in params ({}).",
                param_hints.join("; ")
            ));
        }

        CapabilityDeclaration {
            name: EXTERNAL_API_CAPABILITY.to_string(),
            description,
            parameters,
        }
    }

    fn timeout(&self, arguments: &Value) -> Option<Duration> {
        arguments
            .get("endpoint")
            .and_then(Value::as_str)
            .and_then(|id| self.bridge.catalog.get_active(id))
            .and_then(|spec| spec.timeout_secs.map(Duration::from_secs))
            .or(self.bridge.timeout)
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, CapabilityError> {
        let args: ExternalApiArgs = serde_json::from_value(arguments)
            .map_err(|e| CapabilityError::InvalidArguments(e.to_string()))?;
        self.bridge
            .call(&args.endpoint, args.method.as_deref(), &args.params)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityResult, CapabilitySet};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path, query_param},
    };

    fn bridge_for(endpoints: Vec<EndpointSpec>) -> ExternalApiBridge {
        let catalog = EndpointCatalog::from_file(CatalogFile { endpoints }, None).unwrap();
        ExternalApiBridge::new(Arc::new(catalog))
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn server_error_becomes_status_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/boom"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let bridge = bridge_for(vec![EndpointSpec::new("boom", "", format!("{}/boom", server.uri()))]);
        let set = CapabilitySet::default().with(Arc::new(ExternalApiCapability::new(bridge)));

        let result = set
            .invoke("call_external_api", json!({ "endpoint": "boom", "params": {} }))
            .await;
        match result {
            CapabilityResult::Failure(reason) => assert!(reason.contains("500"), "{reason}"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn image_endpoint_is_reshaped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dog"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "message": "http://x/img.png", "status": "success" })),
            )
            .mount(&server)
            .await;

        let spec = EndpointSpec::new("dog", "A dog", format!("{}/dog", server.uri()))
            .as_image("Here's a random dog picture!");
        let bridge = bridge_for(vec![spec]);

        let value = bridge.call("dog", None, &Map::new()).await.unwrap();
        assert_eq!(value["response_type"], "image");
        assert_eq!(value["response"]["image_url"], "http://x/img.png");

        let output: Value =
            serde_json::from_str(&CapabilityResult::Success(value).to_output_string()).unwrap();
        assert_eq!(output["url"], "http://x/img.png");
        assert!(!output["description"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn path_and_query_params_are_substituted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather/London"))
            .and(query_param("format", "j1"))
            .and(query_param("units", "metric"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "temp_c": 12 })))
            .expect(1)
            .mount(&server)
            .await;

        let mut spec = EndpointSpec::new(
            "weather",
            "Weather",
            format!("{}/weather/{{city}}?format=j1", server.uri()),
        )
        .with_params(&["city"]);
        spec.query_params = vec!["units".into()];
        let bridge = bridge_for(vec![spec]);

        let value = bridge
            .call("weather", None, &params(json!({ "city": "London", "units": "metric" })))
            .await
            .unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["method"], "GET");
        assert_eq!(value["response"]["temp_c"], 12);
    }

    #[tokio::test]
    async fn missing_path_param_is_invalid_arguments() {
        let bridge = bridge_for(vec![
            EndpointSpec::new("weather", "", "http://127.0.0.1:9/{city}").with_params(&["city"]),
        ]);
        let err = bridge.call("weather", None, &Map::new()).await.unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn bearer_header_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Authorization", "Bearer k1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let mut spec = EndpointSpec::new("secure", "", server.uri());
        spec.auth_type = AuthType::Header;
        spec.api_key = Some("k1".into());
        let value = bridge_for(vec![spec]).call("secure", None, &Map::new()).await.unwrap();
        assert_eq!(value["response"]["ok"], true);
    }

    #[tokio::test]
    async fn query_auth_appends_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("appid", "k2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let mut spec = EndpointSpec::new("owm", "", server.uri());
        spec.auth_type = AuthType::Query;
        spec.auth_param = "appid".into();
        spec.api_key = Some("k2".into());
        bridge_for(vec![spec]).call("owm", None, &Map::new()).await.unwrap();
    }

    #[tokio::test]
    async fn missing_credential_is_unavailable_without_a_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut spec = EndpointSpec::new("search", "", server.uri());
        spec.auth_type = AuthType::Query;
        spec.api_key = Some("your_api_key_here".into());
        let err = bridge_for(vec![spec]).call("search", None, &Map::new()).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Unavailable(_)));
        assert!(err.to_string().contains("search"));
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nope</html>"))
            .mount(&server)
            .await;

        let err = bridge_for(vec![EndpointSpec::new("html", "", server.uri())])
            .call("html", None, &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Decode { .. }));
    }

    #[tokio::test]
    async fn post_renders_body_template() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({ "q": "hola", "target": "en", "format": "text" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "translated": "hello" })))
            .expect(1)
            .mount(&server)
            .await;

        let mut spec = EndpointSpec::new("translate", "", server.uri());
        spec.method = "POST".into();
        spec.body_template = params(json!({ "q": "{text}", "target": "{target}", "format": "text" })).into();

        let value = bridge_for(vec![spec])
            .call("translate", None, &params(json!({ "text": "hola", "target": "en" })))
            .await
            .unwrap();
        assert_eq!(value["method"], "POST");
        assert_eq!(value["response"]["translated"], "hello");
    }

    #[tokio::test]
    async fn inactive_and_unknown_endpoints_are_rejected() {
        let mut spec = EndpointSpec::new("off", "", "http://127.0.0.1:9/");
        spec.active = false;
        let bridge = bridge_for(vec![spec]);
        assert!(matches!(
            bridge.call("off", None, &Map::new()).await,
            Err(CapabilityError::UnknownEndpoint(_))
        ));
        assert!(matches!(
            bridge.call("nope", None, &Map::new()).await,
            Err(CapabilityError::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let file = CatalogFile {
            endpoints: vec![
                EndpointSpec::new("a", "", "http://x/"),
                EndpointSpec::new("a", "", "http://y/"),
            ],
        };
        assert!(matches!(
            EndpointCatalog::from_file(file, None),
            Err(CatalogError::DuplicateId(id)) if id == "a"
        ));
    }

    #[test]
    fn catalog_file_defaults() {
        let file: CatalogFile =
            serde_json::from_str(r#"{"endpoints":[{"id":"cat","url":"https://catfact.ninja/fact"}]}"#)
                .unwrap();
        let spec = &file.endpoints[0];
        assert_eq!(spec.method, "GET");
        assert!(spec.active);
        assert_eq!(spec.auth_type, AuthType::None);
        assert_eq!(spec.image_field, "message");
    }

    #[test]
    fn builtin_catalog_instructions_and_ids() {
        let catalog = EndpointCatalog::builtin();
        let ids = catalog.active_ids();
        assert!(ids.contains(&"weather".to_string()));
        assert!(ids.contains(&"dog".to_string()));
        let instructions = catalog.instructions();
        assert!(instructions.starts_with("Configured API endpoints:"));
        assert!(instructions.contains("- weather: "));
        assert!(instructions.contains("Example: \"Show me a dog\""));
    }

    #[test]
    fn redaction_masks_keys() {
        let mut spec = EndpointSpec::new("s", "", "http://x/");
        spec.api_key = Some("real-key".into());
        let catalog = EndpointCatalog::from_file(CatalogFile { endpoints: vec![spec] }, None).unwrap();
        assert_eq!(catalog.redacted().endpoints[0].api_key.as_deref(), Some(REDACTED));
        assert_eq!(catalog.snapshot().endpoints[0].api_key.as_deref(), Some("real-key"));
    }

    #[tokio::test]
    async fn replace_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("api_config.json");

        let catalog = EndpointCatalog::load(&path).unwrap();
        assert_eq!(catalog.len(), builtin_endpoints().len());

        let count = catalog
            .replace(CatalogFile {
                endpoints: vec![EndpointSpec::new("only", "The only one", "http://x/")],
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(catalog.active_ids(), vec!["only"]);

        let reloaded = EndpointCatalog::load(&path).unwrap();
        assert_eq!(reloaded.active_ids(), vec!["only"]);
    }

    #[test]
    fn declaration_lists_active_endpoints() {
        let capability = ExternalApiCapability::new(ExternalApiBridge::new(Arc::new(EndpointCatalog::builtin())));
        let declaration = capability.declaration();
        let endpoints = declaration.parameters["properties"]["endpoint"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(endpoints.len(), builtin_endpoints().len());
        assert_eq!(declaration.parameters["properties"]["method"]["type"], "string");
        assert!(declaration.description.contains("weather: city"));
    }

    #[test]
    fn endpoint_timeout_overrides_bridge_default() {
        let mut spec = EndpointSpec::new("slow", "", "http://x/");
        spec.timeout_secs = Some(20);
        let bridge = bridge_for(vec![spec, EndpointSpec::new("fast", "", "http://y/")])
            .with_timeout(Duration::from_secs(5));
        let capability = ExternalApiCapability::new(bridge);

        assert_eq!(
            capability.timeout(&json!({ "endpoint": "slow" })),
            Some(Duration::from_secs(20))
        );
        assert_eq!(
            capability.timeout(&json!({ "endpoint": "fast" })),
            Some(Duration::from_secs(5))
        );
    }
}
