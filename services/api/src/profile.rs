//! Session Profiles
//!
//! Each WebSocket route runs the same relay engine with a different profile:
//! which capabilities the model may call, how eager voice activity detection
//! is, and how the model is instructed. Profiles are fixed at compile time;
//! only the [`VoiceSettings`] of a live session can change.

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use voicebot_core::{
    external_api::EXTERNAL_API_CAPABILITY, knowledge::SEARCH_CAPABILITY,
    workflow::WORKFLOW_CAPABILITY,
};

pub const DEFAULT_VOICE: &str = "alloy";
/// The realtime API rejects temperatures outside this range.
pub const TEMPERATURE_RANGE: (f32, f32) = (0.6, 1.2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    /// Full assistant with knowledge base, external APIs and workflows (`/ws`).
    Assistant,
    /// Demo profile with external APIs and the knowledge base (`/realtime`).
    Realtime,
    /// Low-latency conversation without tools (`/rtc`).
    Rtc,
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Assistant => "assistant",
            Self::Realtime => "realtime",
            Self::Rtc => "rtc",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadSettings {
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionProfile {
    pub kind: ProfileKind,
    pub capabilities: &'static [&'static str],
    /// `None` means the client commits audio turns itself.
    pub vad: Option<VadSettings>,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
    base_instructions: &'static str,
}

const ASSISTANT_INSTRUCTIONS: &str = "You are a helpful AI assistant with FULL ACCESS to a knowledge base \
through the search_knowledge_base function. When users ask about uploaded documents, policies or any \
stored information, ALWAYS call search_knowledge_base first and answer from the returned content, \
citing the source file. Use call_external_api for live data such as weather, jokes or facts, and \
execute_workflow when the user asks you to run a business process. Be conversational and concise.";

const REALTIME_INSTRUCTIONS: &str = "You are a helpful AI assistant with access to real-time information \
and APIs. Be conversational and friendly. When users ask for weather, jokes, facts, or other \
information, use the appropriate function to get real, current data. Always announce when you're \
calling an API, like 'Let me check that for you'.";

const RTC_INSTRUCTIONS: &str = "You are a helpful, witty, and friendly AI assistant. Keep responses \
concise and natural. Respond quickly and conversationally. Don't over-explain unless asked.";

impl SessionProfile {
    pub fn assistant() -> Self {
        Self {
            kind: ProfileKind::Assistant,
            capabilities: &[SEARCH_CAPABILITY, EXTERNAL_API_CAPABILITY, WORKFLOW_CAPABILITY],
            vad: Some(VadSettings {
                threshold: 0.3,
                prefix_padding_ms: 500,
                silence_duration_ms: 600,
            }),
            temperature: 0.7,
            max_output_tokens: None,
            base_instructions: ASSISTANT_INSTRUCTIONS,
        }
    }

    pub fn realtime() -> Self {
        Self {
            kind: ProfileKind::Realtime,
            capabilities: &[EXTERNAL_API_CAPABILITY, SEARCH_CAPABILITY],
            vad: Some(VadSettings {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 200,
            }),
            temperature: 0.8,
            max_output_tokens: Some(4096),
            base_instructions: REALTIME_INSTRUCTIONS,
        }
    }

    pub fn rtc() -> Self {
        Self {
            kind: ProfileKind::Rtc,
            capabilities: &[],
            vad: Some(VadSettings {
                threshold: 0.3,
                prefix_padding_ms: 100,
                silence_duration_ms: 150,
            }),
            temperature: 0.9,
            max_output_tokens: Some(2048),
            base_instructions: RTC_INSTRUCTIONS,
        }
    }

    pub fn for_kind(kind: ProfileKind) -> Self {
        match kind {
            ProfileKind::Assistant => Self::assistant(),
            ProfileKind::Realtime => Self::realtime(),
            ProfileKind::Rtc => Self::rtc(),
        }
    }

    /// Switches the profile to client-driven turn commits.
    pub fn without_vad(mut self) -> Self {
        self.vad = None;
        self
    }

    pub fn uses_server_vad(&self) -> bool {
        self.vad.is_some()
    }

    pub fn offers(&self, capability: &str) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn default_settings(&self) -> VoiceSettings {
        VoiceSettings {
            voice: DEFAULT_VOICE.to_string(),
            temperature: self.temperature,
            custom_instructions: None,
        }
    }

    /// Assembles the model instructions for the given settings.
    ///
    /// `endpoint_help` is the catalog listing and is only included when the
    /// profile offers the external API capability.
    pub fn instructions(&self, settings: &VoiceSettings, endpoint_help: &str) -> String {
        let mut text = self.base_instructions.to_string();

        if self.offers(EXTERNAL_API_CAPABILITY) && !endpoint_help.is_empty() {
            text.push_str("\n\n");
            text.push_str(endpoint_help);
        }

        match settings.custom_instructions.as_deref().map(str::trim) {
            Some(custom) if !custom.is_empty() => {
                text.push_str("\n\nAdditional instructions: ");
                text.push_str(custom);
            }
            _ => text.push_str(" Speak at a normal, comfortable pace."),
        }

        if !self.capabilities.is_empty() {
            text.push_str(" Always explain what you're doing when using functions.");
        }
        text
    }
}

/// The subset of session configuration a client may change mid-session.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSettings {
    pub voice: String,
    pub temperature: f32,
    pub custom_instructions: Option<String>,
}

/// A partial settings update as sent by the client. Absent fields keep their
/// current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl VoiceSettings {
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(voice) = patch.voice.as_deref().filter(|v| !v.trim().is_empty()) {
            self.voice = voice.to_string();
        }
        if let Some(temperature) = patch.temperature {
            self.temperature = temperature.clamp(TEMPERATURE_RANGE.0, TEMPERATURE_RANGE.1);
        }
        if let Some(instructions) = &patch.instructions {
            self.custom_instructions = Some(instructions.clone()).filter(|i| !i.trim().is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_expose_expected_capabilities() {
        assert_eq!(SessionProfile::assistant().capabilities.len(), 3);
        assert!(SessionProfile::realtime().offers(EXTERNAL_API_CAPABILITY));
        assert!(!SessionProfile::realtime().offers(WORKFLOW_CAPABILITY));
        assert!(SessionProfile::rtc().capabilities.is_empty());
    }

    #[test]
    fn for_kind_round_trips() {
        for kind in [ProfileKind::Assistant, ProfileKind::Realtime, ProfileKind::Rtc] {
            assert_eq!(SessionProfile::for_kind(kind).kind, kind);
        }
    }

    #[test]
    fn endpoint_help_only_for_external_api_profiles() {
        let help = "Configured API endpoints:\n- weather: Get weather";
        let assistant = SessionProfile::assistant();
        let rtc = SessionProfile::rtc();

        let text = assistant.instructions(&assistant.default_settings(), help);
        assert!(text.contains("- weather: Get weather"));
        assert!(text.ends_with("Always explain what you're doing when using functions."));

        let text = rtc.instructions(&rtc.default_settings(), help);
        assert!(!text.contains("weather"));
        assert!(!text.contains("using functions"));
        assert!(text.ends_with("Speak at a normal, comfortable pace."));
    }

    #[test]
    fn custom_instructions_replace_pace_hint() {
        let profile = SessionProfile::realtime();
        let mut settings = profile.default_settings();
        settings.apply(&SettingsPatch {
            instructions: Some("Answer like a pirate.".into()),
            ..Default::default()
        });

        let text = profile.instructions(&settings, "");
        assert!(text.contains("Additional instructions: Answer like a pirate."));
        assert!(!text.contains("comfortable pace"));
    }

    #[test]
    fn patch_merges_and_clamps() {
        let profile = SessionProfile::assistant();
        let mut settings = profile.default_settings();

        settings.apply(&SettingsPatch {
            voice: Some("verse".into()),
            temperature: Some(2.0),
            instructions: None,
        });
        assert_eq!(settings.voice, "verse");
        assert_eq!(settings.temperature, 1.2);
        assert_eq!(settings.custom_instructions, None);

        settings.apply(&SettingsPatch {
            voice: Some("  ".into()),
            ..Default::default()
        });
        assert_eq!(settings.voice, "verse");
    }

    #[test]
    fn without_vad_disables_server_turns() {
        let profile = SessionProfile::assistant().without_vad();
        assert!(!profile.uses_server_vad());
    }
}
