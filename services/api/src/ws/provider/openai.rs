//! OpenAI Realtime connector and session configuration.

use super::UpstreamConnector;
use crate::{
    config::Config,
    profile::{SessionProfile, VoiceSettings},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use openai_realtime::{
    RealtimeConfig, RealtimeLink,
    types::{SessionConfig, ToolDefinition, TranscriptionConfig, TurnDetection},
};
use tracing::info;
use voicebot_core::CapabilityDeclaration;

const AUDIO_FORMAT: &str = "pcm16";
const TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Connects to the OpenAI Realtime API. Without an API key every connect
/// attempt fails, which surfaces as a handshake error on the session.
pub struct OpenAiConnector {
    config: Option<RealtimeConfig>,
}

impl OpenAiConnector {
    pub fn new(config: Option<RealtimeConfig>) -> Self {
        Self { config }
    }

    pub fn from_config(config: &Config) -> Self {
        let realtime = config.openai_api_key.as_ref().map(|key| {
            let mut realtime = RealtimeConfig::new(key.clone());
            realtime.url = config.realtime_url.clone();
            realtime.model = config.realtime_model.clone();
            realtime
        });
        Self::new(realtime)
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }
}

#[async_trait]
impl UpstreamConnector for OpenAiConnector {
    async fn connect(&self) -> Result<RealtimeLink> {
        let config = self
            .config
            .as_ref()
            .context("OpenAI API key is not configured")?;
        let link = openai_realtime::connect(config).await?;
        info!(model = %config.model, "Connected to OpenAI Realtime API");
        Ok(link)
    }
}

fn turn_detection(profile: &SessionProfile) -> Option<TurnDetection> {
    profile.vad.map(|vad| TurnDetection::ServerVad {
        threshold: vad.threshold,
        prefix_padding_ms: vad.prefix_padding_ms,
        silence_duration_ms: vad.silence_duration_ms,
        create_response: true,
        interrupt_response: None,
    })
}

/// The full configuration sent during the handshake and on `session.config`.
pub fn session_config(
    profile: &SessionProfile,
    settings: &VoiceSettings,
    declarations: &[CapabilityDeclaration],
    endpoint_help: &str,
) -> SessionConfig {
    let tools: Vec<ToolDefinition> = declarations
        .iter()
        .map(|d| ToolDefinition::function(&d.name, &d.description, d.parameters.clone()))
        .collect();
    let has_tools = !tools.is_empty();

    SessionConfig {
        modalities: Some(vec!["text".to_string(), "audio".to_string()]),
        instructions: Some(profile.instructions(settings, endpoint_help)),
        voice: Some(settings.voice.clone()),
        input_audio_format: Some(AUDIO_FORMAT.to_string()),
        output_audio_format: Some(AUDIO_FORMAT.to_string()),
        input_audio_transcription: Some(TranscriptionConfig {
            model: TRANSCRIPTION_MODEL.to_string(),
        }),
        turn_detection: Some(turn_detection(profile)),
        tools: has_tools.then_some(tools),
        tool_choice: has_tools.then(|| "auto".to_string()),
        temperature: Some(settings.temperature),
        max_response_output_tokens: profile.max_output_tokens,
    }
}

/// A partial update carrying only what `update_settings` may change.
pub fn settings_update(
    profile: &SessionProfile,
    settings: &VoiceSettings,
    endpoint_help: &str,
) -> SessionConfig {
    SessionConfig {
        instructions: Some(profile.instructions(settings, endpoint_help)),
        voice: Some(settings.voice.clone()),
        temperature: Some(settings.temperature),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declaration(name: &str) -> CapabilityDeclaration {
        CapabilityDeclaration {
            name: name.to_string(),
            description: format!("{name} description"),
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    #[test]
    fn full_config_declares_tools_and_vad() {
        let profile = SessionProfile::realtime();
        let config = session_config(
            &profile,
            &profile.default_settings(),
            &[declaration("call_external_api")],
            "Configured API endpoints:",
        );
        let value = serde_json::to_value(&config).unwrap();

        assert_eq!(value["modalities"], json!(["text", "audio"]));
        assert_eq!(value["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(value["turn_detection"]["type"], "server_vad");
        assert_eq!(value["turn_detection"]["threshold"], 0.5);
        assert_eq!(value["turn_detection"]["silence_duration_ms"], 200);
        assert_eq!(value["tools"][0]["type"], "function");
        assert_eq!(value["tools"][0]["name"], "call_external_api");
        assert_eq!(value["tool_choice"], "auto");
        assert_eq!(value["max_response_output_tokens"], 4096);
        assert!(
            value["instructions"]
                .as_str()
                .unwrap()
                .contains("Configured API endpoints:")
        );
    }

    #[test]
    fn disabled_vad_is_sent_as_null() {
        let profile = SessionProfile::assistant().without_vad();
        let config = session_config(&profile, &profile.default_settings(), &[], "");
        let value = serde_json::to_value(&config).unwrap();

        assert!(value["turn_detection"].is_null());
        assert!(value.as_object().unwrap().contains_key("turn_detection"));
        assert!(value.get("tools").is_none());
        assert!(value.get("tool_choice").is_none());
        assert!(value.get("max_response_output_tokens").is_none());
    }

    #[test]
    fn settings_update_is_partial() {
        let profile = SessionProfile::rtc();
        let mut settings = profile.default_settings();
        settings.voice = "verse".into();
        let value = serde_json::to_value(settings_update(&profile, &settings, "")).unwrap();

        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(value["voice"], "verse");
    }

    #[tokio::test]
    async fn connect_without_key_fails() {
        let connector = OpenAiConnector::new(None);
        assert!(!connector.is_configured());
        let err = connector.connect().await.err().unwrap();
        assert!(err.to_string().contains("API key"));
    }
}
