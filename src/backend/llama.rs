//! Response generator backed by a llama.cpp server
//!
//! Talks to the OpenAI-compatible `/v1/chat/completions` endpoint that
//! `llama-server` exposes.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{BackendError, Generated, ResponseGenerator, TokenUsage};
use crate::modes::Mode;

const SERVICE: &str = "response generator";

pub struct LlamaResponder {
    endpoint: String,
    model: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlamaResponder {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            endpoint: format!("{}/v1/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            client: Client::new(),
        }
    }

    fn request_body(&self, text: &str, mode: &Mode) -> Value {
        json!({
            "model": self.model,
            "stream": false,
            "messages": [
                { "role": "system", "content": mode.style.instructions() },
                { "role": "user", "content": text },
            ],
        })
    }
}

fn parse_completion(body: &str) -> Result<Generated, BackendError> {
    let completion: ChatCompletion = serde_json::from_str(body)
        .map_err(|e| BackendError::failed(SERVICE, format!("invalid completion body: {e}")))?;

    let text = completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| BackendError::failed(SERVICE, "completion contained no text"))?;

    Ok(Generated {
        text,
        usage: completion.usage.unwrap_or_default(),
        suggested_mode: None,
    })
}

#[async_trait]
impl ResponseGenerator for LlamaResponder {
    async fn generate(&self, text: &str, mode: &Mode) -> Result<Generated, BackendError> {
        debug!(endpoint = %self.endpoint, mode = %mode, "requesting completion");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&self.request_body(text, mode))
            .send()
            .await
            .map_err(|e| BackendError::failed(SERVICE, format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::failed(SERVICE, format!("failed to read body: {e}")))?;

        if !status.is_success() {
            return Err(BackendError::failed(SERVICE, format!("server returned {status}: {body}")));
        }

        parse_completion(&body)
    }
}
