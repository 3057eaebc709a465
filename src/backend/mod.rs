//! External collaborators consumed by voice sessions
//!
//! The session core only tracks state; turning input into text and text
//! into a reply is delegated to implementations of the traits below.

mod llama;
mod local;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::Config;
use crate::modes::Mode;

pub use llama::LlamaResponder;
pub use local::{PassthroughTranscriber, ScriptedResponder};

/// Raw input handed to the transcription service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Text typed by the user, bypassing audio capture
    Text(String),
    /// Opaque handle to captured audio (e.g. a recorded clip path)
    Audio(String),
}

/// Token accounting reported by the response generator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A generated reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub text: String,
    pub usage: TokenUsage,
    /// Mode the generator thinks would suit the conversation better
    pub suggested_mode: Option<String>,
}

/// Failures reported by an external collaborator. Always fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("{service} failed: {message}")]
    Failed { service: &'static str, message: String },

    #[error("{service} timed out after {timeout_ms}ms")]
    Timeout { service: &'static str, timeout_ms: u64 },
}

/// Base code shared by every collaborator failure, timeouts included
pub const COLLABORATOR_ERROR: &str = "ExternalCollaboratorError";

impl BackendError {
    pub fn failed(service: &'static str, message: impl Into<String>) -> Self {
        BackendError::Failed {
            service,
            message: message.into(),
        }
    }

    /// Wire code. `TimeoutError` is a subcode of `ExternalCollaboratorError`.
    pub fn code(&self) -> &'static str {
        match self {
            BackendError::Failed { .. } => COLLABORATOR_ERROR,
            BackendError::Timeout { .. } => "TimeoutError",
        }
    }
}

/// Speech-to-text service
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, input: Input) -> Result<String, BackendError>;
}

/// Reply generator (LLM or otherwise)
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, text: &str, mode: &Mode) -> Result<Generated, BackendError>;
}

/// The collaborators shared by every session
#[derive(Clone)]
pub struct Backends {
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn ResponseGenerator>,
}

impl Backends {
    pub fn new(transcriber: Arc<dyn Transcriber>, responder: Arc<dyn ResponseGenerator>) -> Self {
        Self {
            transcriber,
            responder,
        }
    }

    /// In-process collaborators that need no models
    pub fn local() -> Self {
        Self::new(Arc::new(PassthroughTranscriber), Arc::new(ScriptedResponder))
    }

    /// Use the llama.cpp server when one is configured, local collaborators otherwise
    pub fn from_config(config: &Config) -> Self {
        match &config.llm_url {
            Some(url) => {
                info!(%url, model = %config.llm_model, "using llama.cpp response generator");
                Self::new(
                    Arc::new(PassthroughTranscriber),
                    Arc::new(LlamaResponder::new(url, &config.llm_model)),
                )
            }
            None => {
                info!("no LLM configured, using scripted responses");
                Self::local()
            }
        }
    }
}
