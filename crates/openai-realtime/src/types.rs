//! Event types for the Realtime API.
//!
//! Both directions are closed, internally tagged enums keyed on the `type`
//! field. Inbound decoding is lenient: missing fields fall back to defaults
//! and unrecognized event kinds land in [`ServerEvent::Unknown`].

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// --- Outbound ---

/// Events sent from this server to the realtime endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    /// Wraps raw PCM16 bytes in an append event.
    pub fn audio_append(pcm: &[u8]) -> Self {
        Self::InputAudioBufferAppend {
            audio: BASE64.encode(pcm),
        }
    }

    /// A user text message as a conversation item.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem::Message {
                role: Role::User,
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        }
    }

    /// The output of a locally executed function call.
    pub fn function_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.into(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            Self::InputAudioBufferCommit => "input_audio_buffer.commit",
            Self::InputAudioBufferClear => "input_audio_buffer.clear",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
            Self::ResponseCreate => "response.create",
        }
    }
}

/// Session parameters. Every field is optional so the same type serves the
/// full handshake and partial live updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    /// `Some(None)` serializes as `null`, which turns server VAD off.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "explicit_null"
    )]
    pub turn_detection: Option<Option<TurnDetection>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<u32>,
}

fn explicit_null<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
        create_response: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interrupt_response: Option<bool>,
    },
}

/// A function the model may call, with its JSON schema parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: "function".to_string(),
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message { role: Role, content: Vec<ContentPart> },
    FunctionCallOutput { call_id: String, output: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
}

// --- Inbound ---

/// Events received from the realtime endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ApiError,
    },
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: Value,
    },
    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Value,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "input_audio_buffer.committed")]
    AudioCommitted {
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "input_audio_buffer.cleared")]
    AudioCleared,
    #[serde(rename = "conversation.item.created")]
    ItemCreated {
        #[serde(default)]
        item: ItemInfo,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptionDelta {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.partial")]
    TranscriptionPartial {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    TranscriptionFailed {
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        error: ApiError,
    },
    #[serde(rename = "conversation.item.truncated")]
    ItemTruncated {
        #[serde(default)]
        item_id: Option<String>,
    },
    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },
    #[serde(rename = "response.cancelled")]
    ResponseCancelled {
        #[serde(default)]
        response_id: Option<String>,
    },
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        #[serde(default)]
        item: ItemInfo,
    },
    #[serde(rename = "response.content_part.done")]
    ContentPartDone {
        #[serde(default)]
        part: ContentInfo,
    },
    #[serde(rename = "response.text.delta")]
    TextDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.text.done")]
    TextDone {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.audio.done")]
    AudioDone,
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        #[serde(default)]
        call_id: String,
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },
    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated {
        #[serde(default)]
        rate_limits: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ApiError {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// A conversation item as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ItemInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentInfo>,
}

impl ItemInfo {
    /// The first transcript attached to an `input_audio` content part.
    pub fn input_audio_transcript(&self) -> Option<&str> {
        self.content
            .iter()
            .filter(|c| c.kind.as_deref() == Some("input_audio"))
            .find_map(|c| c.transcript.as_deref().filter(|t| !t.is_empty()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContentInfo {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commit_and_response_create_are_bare_type_tags() {
        let commit = serde_json::to_value(ClientEvent::InputAudioBufferCommit).unwrap();
        assert_eq!(commit, json!({"type": "input_audio_buffer.commit"}));

        let create = serde_json::to_value(ClientEvent::ResponseCreate).unwrap();
        assert_eq!(create, json!({"type": "response.create"}));
    }

    #[test]
    fn function_output_item_shape() {
        let event = ClientEvent::function_output("call_1", "{\"ok\":true}");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "conversation.item.create");
        assert_eq!(value["item"]["type"], "function_call_output");
        assert_eq!(value["item"]["call_id"], "call_1");
        assert_eq!(value["item"]["output"], "{\"ok\":true}");
    }

    #[test]
    fn user_text_item_shape() {
        let value = serde_json::to_value(ClientEvent::user_text("hi")).unwrap();
        assert_eq!(value["item"]["type"], "message");
        assert_eq!(value["item"]["role"], "user");
        assert_eq!(value["item"]["content"][0]["type"], "input_text");
        assert_eq!(value["item"]["content"][0]["text"], "hi");
    }

    #[test]
    fn audio_append_is_base64() {
        let value = serde_json::to_value(ClientEvent::audio_append(&[0, 1, 2])).unwrap();
        assert_eq!(value["audio"], "AAEC");
    }

    #[test]
    fn disabled_vad_serializes_as_null() {
        let config = SessionConfig {
            turn_detection: Some(None),
            ..Default::default()
        };
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value, json!({"turn_detection": null}));

        let back: SessionConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back.turn_detection, Some(None));
    }

    #[test]
    fn partial_update_omits_unset_fields() {
        let config = SessionConfig {
            voice: Some("verse".into()),
            temperature: Some(0.6),
            ..Default::default()
        };
        let value = serde_json::to_value(&config).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert!(object.contains_key("voice"));
    }

    #[test]
    fn server_vad_tagging() {
        let vad = TurnDetection::ServerVad {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 200,
            create_response: true,
            interrupt_response: None,
        };
        let value = serde_json::to_value(vad).unwrap();
        assert_eq!(value["type"], "server_vad");
        assert_eq!(value["silence_duration_ms"], 200);
        assert!(value.get("interrupt_response").is_none());
    }

    #[test]
    fn decodes_function_call_arguments_done() {
        let raw = r#"{"type":"response.function_call_arguments.done","event_id":"e1","response_id":"r","item_id":"i","output_index":0,"call_id":"call_9","name":"search_knowledge_base","arguments":"{\"query\":\"refund\"}"}"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            ServerEvent::FunctionCallArgumentsDone {
                call_id: "call_9".into(),
                name: Some("search_knowledge_base".into()),
                arguments: "{\"query\":\"refund\"}".into(),
            }
        );
    }

    #[test]
    fn unknown_event_kind_is_not_an_error() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"response.brand_new_thing","x":1}"#).unwrap();
        assert_eq!(event, ServerEvent::Unknown);
    }

    #[test]
    fn error_event_with_missing_fields() {
        let event: ServerEvent = serde_json::from_str(r#"{"type":"error"}"#).unwrap();
        match event {
            ServerEvent::Error { error } => assert!(error.message.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn item_created_exposes_input_audio_transcript() {
        let raw = r#"{"type":"conversation.item.created","item":{"id":"i1","type":"message","role":"user","content":[{"type":"input_audio","transcript":"hello there"}]}}"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        let ServerEvent::ItemCreated { item } = event else {
            panic!("expected item created");
        };
        assert_eq!(item.role.as_deref(), Some("user"));
        assert_eq!(item.input_audio_transcript(), Some("hello there"));
    }

    #[test]
    fn malformed_json_fails_to_decode() {
        assert!(serde_json::from_str::<ServerEvent>("{not json").is_err());
        assert!(serde_json::from_str::<ServerEvent>(r#"{"no_type":1}"#).is_err());
    }
}
