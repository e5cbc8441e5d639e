//! WebSocket connector for the Realtime API.

use anyhow::{Context, Result};
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use secrecy::{ExposeSecret, SecretString};
use std::pin::Pin;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
};
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

/// Connection parameters for one realtime session.
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub url: String,
    pub model: String,
    pub api_key: SecretString,
}

impl RealtimeConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            model: DEFAULT_REALTIME_MODEL.to_string(),
            api_key: SecretString::from(api_key.into()),
        }
    }

    /// The endpoint URL with the model selected through the query string.
    pub fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)
            .with_context(|| format!("Invalid realtime URL '{}'", self.url))?;
        url.query_pairs_mut().append_pair("model", &self.model);
        Ok(url)
    }
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = anyhow::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A duplex channel of JSON text frames.
///
/// Control and binary frames never surface here; the stream ends when the
/// remote side closes.
pub struct RealtimeLink {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl RealtimeLink {
    pub fn new(
        sink: impl Sink<String, Error = anyhow::Error> + Send + 'static,
        stream: impl Stream<Item = Result<String>> + Send + 'static,
    ) -> Self {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens an authenticated WebSocket to the realtime endpoint.
pub async fn connect(config: &RealtimeConfig) -> Result<RealtimeLink> {
    let url = config.endpoint()?;

    let mut request = url.as_str().into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", config.api_key.expose_secret()).parse()?,
    );
    request
        .headers_mut()
        .insert("OpenAI-Beta", "realtime=v1".parse()?);

    let (ws_stream, _) = connect_async(request)
        .await
        .context("Failed to connect to OpenAI Realtime WebSocket")?;
    info!(model = %config.model, "Connected to OpenAI Realtime API.");

    let (ws_tx, ws_rx) = ws_stream.split();

    let sink = ws_tx.with(|text: String| {
        future::ready(Ok::<_, anyhow::Error>(Message::Text(text.into())))
    });

    let stream = ws_rx.filter_map(|frame| {
        future::ready(match frame {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(Message::Close(reason)) => {
                debug!(?reason, "Realtime endpoint sent close frame");
                None
            }
            Ok(_) => None,
            Err(e) => Some(Err(anyhow::Error::from(e))),
        })
    });

    Ok(RealtimeLink::new(sink, stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_carries_model_query() {
        let config = RealtimeConfig::new("sk-test");
        let url = config.endpoint().unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/v1/realtime");
        assert_eq!(
            url.query(),
            Some("model=gpt-4o-realtime-preview-2024-12-17")
        );
    }

    #[test]
    fn endpoint_rejects_garbage_url() {
        let mut config = RealtimeConfig::new("sk-test");
        config.url = "not a url".into();
        assert!(config.endpoint().is_err());
    }

    #[test]
    fn api_key_is_redacted_in_debug() {
        let config = RealtimeConfig::new("sk-very-secret");
        assert!(!format!("{config:?}").contains("sk-very-secret"));
    }
}
