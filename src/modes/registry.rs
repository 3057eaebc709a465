//! Fixed mapping from mode name to response-style configuration

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

/// Returned when a name is not registered
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown mode '{0}'")]
pub struct UnknownModeError(pub String);

/// Parameters that guide downstream response generation.
///
/// Opaque to the session core; handed to the response generator as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseStyle {
    /// What the assistant should concentrate on
    pub focus: String,
    /// How the assistant should sound
    pub tone: String,
    /// System prompt for LLM-backed generators
    pub system_prompt: String,
}

impl ResponseStyle {
    /// System instructions combining the prompt with focus and tone
    pub fn instructions(&self) -> String {
        format!("{} Focus on {}. Tone: {}.", self.system_prompt, self.focus, self.tone)
    }
}

/// A named configuration profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mode {
    pub name: String,
    pub style: ResponseStyle,
}

impl Mode {
    pub fn new(name: impl Into<String>, style: ResponseStyle) -> Self {
        Self {
            name: normalize(&name.into()),
            style,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Process-wide set of modes, immutable after construction
#[derive(Debug, Clone)]
pub struct ModeRegistry {
    modes: BTreeMap<String, Arc<Mode>>,
}

impl ModeRegistry {
    /// Build a registry from an arbitrary set of modes.
    ///
    /// Later entries with the same name replace earlier ones.
    pub fn new(modes: impl IntoIterator<Item = Mode>) -> Self {
        let modes = modes
            .into_iter()
            .map(|mode| (mode.name.clone(), Arc::new(mode)))
            .collect();
        Self { modes }
    }

    /// The three modes the tutor ships with: `tutor`, `friend` and `hybrid`
    pub fn builtin() -> Self {
        Self::new([
            Mode::new(
                "tutor",
                ResponseStyle {
                    focus: "ISEE test preparation: math, verbal reasoning, reading \
                        comprehension and essay writing"
                        .into(),
                    tone: "patient, encouraging and structured".into(),
                    system_prompt: "You are an ISEE tutor for middle school students. Explain one \
                        step at a time, check understanding with a short question, and keep \
                        answers brief enough to be spoken aloud."
                        .into(),
                },
            ),
            Mode::new(
                "friend",
                ResponseStyle {
                    focus: "casual conversation and encouragement".into(),
                    tone: "warm, upbeat and relaxed".into(),
                    system_prompt: "You are a friendly study buddy. Chat naturally, be supportive, \
                        and keep replies short and easy to say out loud."
                        .into(),
                },
            ),
            Mode::new(
                "hybrid",
                ResponseStyle {
                    focus: "conversation that slips in ISEE practice when the student is ready"
                        .into(),
                    tone: "friendly but purposeful".into(),
                    system_prompt: "You are a friendly tutor. Keep the conversation relaxed, and \
                        whenever the student touches on schoolwork, turn it into a quick \
                        ISEE-style practice moment. Keep replies short."
                        .into(),
                },
            ),
        ])
    }

    /// Look up a mode by name (case-insensitive, surrounding whitespace ignored)
    pub fn resolve(&self, name: &str) -> Result<Arc<Mode>, UnknownModeError> {
        self.modes
            .get(&normalize(name))
            .cloned()
            .ok_or_else(|| UnknownModeError(name.to_string()))
    }

    /// All registered names, sorted
    pub fn list(&self) -> Vec<String> {
        self.modes.keys().cloned().collect()
    }
}

impl Default for ModeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}
