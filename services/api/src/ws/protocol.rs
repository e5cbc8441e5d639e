//! Defines the WebSocket message protocol between the browser client and the API server.

use crate::profile::{ProfileKind, SettingsPatch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Messages sent from the client (browser) to the server.
///
/// Binary frames carry raw PCM16 audio and never pass through this type.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// A base64 encoded audio chunk.
    #[serde(rename = "audio.input")]
    AudioInput {
        audio: String,
        #[serde(default)]
        format: Option<String>,
    },
    /// A typed user message.
    #[serde(rename = "text.input")]
    TextInput { text: String },
    #[serde(rename = "update_settings")]
    UpdateSettings {
        #[serde(default)]
        settings: SettingsPatch,
    },
    /// Drops any audio the upstream has buffered but not committed.
    #[serde(rename = "reset_audio_state")]
    ResetAudioState,
    /// The user released push-to-talk.
    #[serde(rename = "recording_stopped")]
    RecordingStopped,
    /// Re-sends the full session configuration.
    #[serde(rename = "session.config")]
    SessionConfig {
        #[serde(default)]
        config: SessionConfigRequest,
    },
    /// Adds a document to the knowledge base from inside a session.
    #[serde(rename = "rag.index")]
    RagIndex {
        #[serde(rename = "fileId")]
        file_id: String,
        content: String,
        #[serde(default, rename = "fileName")]
        file_name: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SessionConfigRequest {
    #[serde(default, rename = "enableFunctions")]
    pub enable_functions: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// The upstream session is configured and the relay is running.
    #[serde(rename = "connected")]
    Connected { session_id: Uuid, profile: ProfileKind },
    #[serde(rename = "text.response")]
    TextResponse { text: String },
    /// A chunk of base64 encoded PCM16 audio for the assistant's voice.
    #[serde(rename = "audio.response")]
    AudioResponse { audio: String },
    #[serde(rename = "audio.done")]
    AudioDone,
    /// Provisional transcript text for the current turn.
    #[serde(rename = "transcription")]
    Transcription { text: String, role: Speaker },
    /// The final transcript of a turn. Sent at most once per user turn.
    #[serde(rename = "transcription.complete")]
    TranscriptionComplete { text: String, role: Speaker },
    #[serde(rename = "function_call")]
    FunctionCall {
        name: String,
        arguments: Value,
        call_id: String,
    },
    #[serde(rename = "function.result")]
    FunctionResult {
        function: String,
        call_id: String,
        result: Value,
    },
    #[serde(rename = "speech_started")]
    SpeechStarted,
    #[serde(rename = "speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.created")]
    ResponseCreated,
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "response_interrupted")]
    ResponseInterrupted,
    #[serde(rename = "response_cancelled")]
    ResponseCancelled,
    #[serde(rename = "settings_updated")]
    SettingsUpdated { settings: SettingsPatch },
    #[serde(rename = "rag.indexed")]
    DocumentIndexed { file_id: String, chunks: usize },
    #[serde(rename = "error")]
    Error {
        error: String,
        /// Set when the error originated upstream rather than from the client's input.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        internal: bool,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
            internal: false,
        }
    }
}
