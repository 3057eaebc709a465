//! Session-level error taxonomy
//!
//! Every error that can reach a client carries a stable machine-readable
//! code, sent back as the `code` field of an `error` event. Collaborator
//! failures also carry `category`, so `TimeoutError` can be matched as an
//! `ExternalCollaboratorError`.

use thiserror::Error;

use crate::backend::{BackendError, COLLABORATOR_ERROR};
use crate::modes::UnknownModeError;
use crate::state::State;

/// Errors raised while handling a message or completion for one session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("unknown mode '{0}'")]
    InvalidMode(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("unknown message type '{0}'")]
    UnknownMessageType(String),

    #[error("'{message}' is not allowed while {state}")]
    InvalidState { message: &'static str, state: State },

    #[error("session has been stopped")]
    SessionStopped,

    #[error("unknown session '{0}'")]
    UnknownSession(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl SessionError {
    /// Stable code reported to clients
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidMode(_) => "InvalidModeError",
            SessionError::MalformedMessage(_) => "MalformedMessageError",
            SessionError::UnknownMessageType(_) => "UnknownMessageTypeError",
            SessionError::InvalidState { .. } => "InvalidStateError",
            SessionError::SessionStopped => "SessionStoppedError",
            SessionError::UnknownSession(_) => "UnknownSessionError",
            SessionError::Backend(e) => e.code(),
        }
    }

    /// Base class of `code`, present only for external collaborator errors
    pub fn category(&self) -> Option<&'static str> {
        match self {
            SessionError::Backend(_) => Some(COLLABORATOR_ERROR),
            _ => None,
        }
    }
}

impl From<UnknownModeError> for SessionError {
    fn from(e: UnknownModeError) -> Self {
        SessionError::InvalidMode(e.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(SessionError::InvalidMode("x".into()).code(), "InvalidModeError");
        assert_eq!(
            SessionError::InvalidState { message: "text_input", state: State::Idle }.code(),
            "InvalidStateError"
        );
        assert_eq!(SessionError::UnknownSession("s".into()).code(), "UnknownSessionError");
        assert_eq!(SessionError::InvalidMode("x".into()).category(), None);
    }

    #[test]
    fn test_backend_codes_pass_through() {
        let err: SessionError = BackendError::Timeout {
            service: "transcriber",
            timeout_ms: 10,
        }
        .into();
        assert_eq!(err.code(), "TimeoutError");
        assert_eq!(err.category(), Some("ExternalCollaboratorError"));

        let err: SessionError = BackendError::failed("response generator", "boom").into();
        assert_eq!(err.code(), "ExternalCollaboratorError");
        assert_eq!(err.category(), Some("ExternalCollaboratorError"));
        assert_eq!(err.to_string(), "response generator failed: boom");
    }

    #[test]
    fn test_unknown_mode_conversion() {
        let err: SessionError = UnknownModeError("pirate".into()).into();
        assert_eq!(err, SessionError::InvalidMode("pirate".into()));
    }
}
