//! In-process collaborators used when no models are configured

use async_trait::async_trait;

use super::{BackendError, Generated, Input, ResponseGenerator, TokenUsage, Transcriber};
use crate::modes::Mode;

/// Words that mark an utterance as schoolwork
const STUDY_WORDS: &[&str] = &[
    "isee", "math", "fraction", "equation", "vocabulary", "synonym", "reading", "essay",
    "homework", "test", "quiz", "practice", "study", "question",
];

/// Passes typed text straight through. Has no speech engine, so audio is rejected.
pub struct PassthroughTranscriber;

#[async_trait]
impl Transcriber for PassthroughTranscriber {
    async fn transcribe(&self, input: Input) -> Result<String, BackendError> {
        match input {
            Input::Text(text) => Ok(text.trim().to_string()),
            Input::Audio(handle) => Err(BackendError::failed(
                "transcriber",
                format!("no speech-to-text engine configured for audio handle '{handle}'"),
            )),
        }
    }
}

/// Deterministic mode-aware replies, for running without an LLM
pub struct ScriptedResponder;

impl ScriptedResponder {
    fn reply(text: &str, mode: &Mode) -> String {
        match mode.name.as_str() {
            "tutor" => format!(
                "Let's work through that together. You said: \"{text}\". \
                 What do you think the first step is?"
            ),
            "friend" => format!(
                "Thanks for telling me! \"{text}\" sounds interesting. What happened next?"
            ),
            "hybrid" if is_study_related(text) => format!(
                "Good one, let's turn that into a quick practice round. You said: \"{text}\". \
                 Want to try a sample question?"
            ),
            "hybrid" => format!(
                "I hear you: \"{text}\". Whenever you feel like it, we can squeeze in a little \
                 ISEE practice."
            ),
            _ => format!("({}) {text}", mode.style.tone),
        }
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedResponder {
    async fn generate(&self, text: &str, mode: &Mode) -> Result<Generated, BackendError> {
        let reply = Self::reply(text, mode);
        let suggested_mode = (mode.name == "hybrid").then(|| {
            let hint = if is_study_related(text) { "tutor" } else { "friend" };
            hint.to_string()
        });

        Ok(Generated {
            usage: TokenUsage {
                prompt_tokens: word_count(text),
                completion_tokens: word_count(&reply),
            },
            text: reply,
            suggested_mode,
        })
    }
}

fn is_study_related(text: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_ascii_lowercase)
        .any(|word| STUDY_WORDS.contains(&word.as_str()))
}

fn word_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}
