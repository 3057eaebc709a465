//! Control channel message definitions
//!
//! Clients send one JSON object per WebSocket text frame, discriminated by
//! a `type` field. Decoding happens once, here; nothing past this point
//! sees untyped JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;

/// Inbound messages from client to session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Start listening in the given mode
    VoiceStart { mode: String },

    /// Inject typed input, bypassing audio capture
    TextInput { text: String },

    /// Inject a handle to audio captured elsewhere
    AudioInput { handle: String },

    /// Switch mode without touching the session state
    VoiceMode { mode: String },

    /// Terminate the session
    VoiceStop,

    /// Liveness probe
    Ping,

    /// Request a status snapshot
    GetStatus,
}

const KNOWN_TYPES: &[&str] = &[
    "voice_start",
    "text_input",
    "audio_input",
    "voice_mode",
    "voice_stop",
    "ping",
    "get_status",
];

impl ControlMessage {
    /// Wire name of this message
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::VoiceStart { .. } => "voice_start",
            ControlMessage::TextInput { .. } => "text_input",
            ControlMessage::AudioInput { .. } => "audio_input",
            ControlMessage::VoiceMode { .. } => "voice_mode",
            ControlMessage::VoiceStop => "voice_stop",
            ControlMessage::Ping => "ping",
            ControlMessage::GetStatus => "get_status",
        }
    }

    fn validate(self) -> Result<Self, SessionError> {
        let empty = match &self {
            ControlMessage::TextInput { text } => text.trim().is_empty().then_some("text"),
            ControlMessage::AudioInput { handle } => handle.is_empty().then_some("handle"),
            ControlMessage::VoiceStart { mode } | ControlMessage::VoiceMode { mode } => {
                mode.trim().is_empty().then_some("mode")
            }
            _ => None,
        };

        match empty {
            Some(field) => Err(SessionError::MalformedMessage(format!(
                "'{}' requires a non-empty '{}' field",
                self.kind(),
                field
            ))),
            None => Ok(self),
        }
    }
}

/// Decode one raw frame into a typed message
pub fn decode(raw: &str) -> Result<ControlMessage, SessionError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| SessionError::MalformedMessage(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SessionError::MalformedMessage("missing string field 'type'".into()))?;

    if !KNOWN_TYPES.contains(&kind) {
        return Err(SessionError::UnknownMessageType(kind.to_string()));
    }

    serde_json::from_value::<ControlMessage>(value)
        .map_err(|e| SessionError::MalformedMessage(e.to_string()))?
        .validate()
}
