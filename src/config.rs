//! Configuration loading and management

use std::time::Duration;

use anyhow::{Context, Result};

use crate::session::SessionSettings;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8765";
const DEFAULT_MODE: &str = "tutor";
const DEFAULT_LLM_MODEL: &str = "local";

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the WebSocket server listens on
    pub bind_addr: String,

    /// Mode new sessions start in
    pub default_mode: String,

    /// Idle listening limit; `None` disables it
    pub listen_timeout: Option<Duration>,

    pub transcribe_timeout: Duration,

    pub response_timeout: Duration,

    /// Base URL of a llama.cpp server; scripted responses when unset
    pub llm_url: Option<String>,

    pub llm_model: String,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let millis = |key: &str, default: u64| -> Result<u64> {
            match get(key) {
                Some(value) => value.parse::<u64>().with_context(|| {
                    format!("{key} must be a number of milliseconds, got '{value}'")
                }),
                None => Ok(default),
            }
        };

        let listen_ms = millis("ISEE_VOICE_LISTEN_TIMEOUT_MS", 0)?;
        let transcribe_ms = millis("ISEE_VOICE_TRANSCRIBE_TIMEOUT_MS", 15_000)?;
        let response_ms = millis("ISEE_VOICE_RESPONSE_TIMEOUT_MS", 60_000)?;

        if transcribe_ms == 0 || response_ms == 0 {
            anyhow::bail!("transcription and response timeouts must be greater than zero");
        }

        Ok(Self {
            bind_addr: get("ISEE_VOICE_BIND").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            default_mode: get("ISEE_VOICE_DEFAULT_MODE")
                .unwrap_or_else(|| DEFAULT_MODE.to_string())
                .to_ascii_lowercase(),
            listen_timeout: (listen_ms > 0).then(|| Duration::from_millis(listen_ms)),
            transcribe_timeout: Duration::from_millis(transcribe_ms),
            response_timeout: Duration::from_millis(response_ms),
            llm_url: get("ISEE_VOICE_LLM_URL"),
            llm_model: get("ISEE_VOICE_LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
        })
    }

    /// Settings handed to every new session
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            default_mode: self.default_mode.clone(),
            listen_timeout: self.listen_timeout,
            transcribe_timeout: self.transcribe_timeout,
            response_timeout: self.response_timeout,
        }
    }
}
