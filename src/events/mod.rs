//! Events module for outbound session notifications
//!
//! Every message the daemon sends to a client is an `EventMessage`,
//! JSON-encoded with a `type` tag.

use serde::{Deserialize, Serialize};

use crate::backend::TokenUsage;
use crate::error::SessionError;
use crate::state::State;

/// Events emitted by a session, in the order they are produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMessage {
    /// A session was opened for this connection
    SessionCreated { session_id: String },

    /// Session entered listening in the given mode
    VoiceStarted { mode: String },

    /// State transition notification
    VoiceState { state: State },

    /// Transcription completed
    VoiceTranscript { text: String },

    /// Generated response ready. `voice_response` is accepted as an alias.
    #[serde(alias = "voice_response")]
    TextResponse {
        text: String,
        mode: String,
        #[serde(default)]
        usage: TokenUsage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        suggested_mode: Option<String>,
    },

    /// Mode change acknowledged
    ModeChanged { mode: String, previous: String },

    /// Session terminated
    VoiceStopped,

    /// A fatal or message-level error occurred.
    ///
    /// `category` names the base class of `code` and is only set for
    /// collaborator failures: a `TimeoutError` arrives with category
    /// `ExternalCollaboratorError`.
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        category: Option<String>,
    },

    /// Answer to `ping`
    Pong,

    /// Answer to `get_status`
    Status(SessionStatus),
}

/// Snapshot of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub version: String,
    pub state: State,
    pub mode: String,
    /// Modes the session can switch to
    pub modes: Vec<String>,
    pub generation: u64,
}

impl From<&SessionError> for EventMessage {
    fn from(err: &SessionError) -> Self {
        EventMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            category: err.category().map(str::to_string),
        }
    }
}

impl std::fmt::Display for EventMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventMessage::SessionCreated { session_id } => {
                write!(f, "SESSION_CREATED ({})", session_id)
            }
            EventMessage::VoiceStarted { mode } => write!(f, "VOICE_STARTED ({})", mode),
            EventMessage::VoiceState { state } => write!(f, "VOICE_STATE ({})", state),
            EventMessage::VoiceTranscript { text } => {
                write!(f, "VOICE_TRANSCRIPT ({} chars)", text.len())
            }
            EventMessage::TextResponse { text, mode, .. } => {
                write!(f, "TEXT_RESPONSE ({}, {} chars)", mode, text.len())
            }
            EventMessage::ModeChanged { mode, previous } => {
                write!(f, "MODE_CHANGED ({} -> {})", previous, mode)
            }
            EventMessage::VoiceStopped => write!(f, "VOICE_STOPPED"),
            EventMessage::Error { code, .. } => write!(f, "ERROR ({})", code),
            EventMessage::Pong => write!(f, "PONG"),
            EventMessage::Status(status) => write!(f, "STATUS ({})", status.state),
        }
    }
}
