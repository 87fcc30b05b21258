//! OpenAI-compatible `/chat/completions` backend (OpenAI, DeepSeek, vLLM, Ollama, ...).

use super::{Backend, BackendError};
use crate::session::config::RemoteApiConfig;
use crate::session::protocol::{ASSISTANT_PREFIX, GENERATION_CUE, USER_PREFIX};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Turn a flat prompt back into chat messages.
///
/// The trailing generation cue is dropped. Unprefixed lines become system
/// context, merged with an immediately preceding system message.
pub fn parse_conversation(prompt: &str) -> Vec<ChatMessage> {
    let cue = GENERATION_CUE.trim_end();
    let mut text = prompt.trim_end();
    if let Some(stripped) = text.strip_suffix(cue) {
        if stripped.is_empty() || stripped.ends_with('\n') {
            text = stripped;
        }
    }

    let mut messages: Vec<ChatMessage> = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(content) = line.strip_prefix(USER_PREFIX) {
            messages.push(ChatMessage {
                role: Role::User,
                content: content.to_string(),
            });
        } else if let Some(content) = line.strip_prefix(ASSISTANT_PREFIX) {
            messages.push(ChatMessage {
                role: Role::Assistant,
                content: content.to_string(),
            });
        } else {
            match messages.last_mut() {
                Some(last) if last.role == Role::System => {
                    last.content.push('\n');
                    last.content.push_str(line);
                }
                _ => messages.push(ChatMessage {
                    role: Role::System,
                    content: line.to_string(),
                }),
            }
        }
    }

    messages
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(config: &RemoteApiConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let backend = Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.api_base.trim_end_matches('/').to_string(),
            model: config.api_model.clone(),
        };
        tracing::info!(model = %backend.model, base_url = %backend.base_url, "OpenAI backend ready");
        Ok(backend)
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        stop: &[String],
    ) -> Result<String, BackendError> {
        let request = ChatRequest {
            model: &self.model,
            messages: parse_conversation(prompt),
            max_tokens,
            temperature,
            stop: stop.to_vec(),
        };

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        extract_reply(parsed)
    }
}

fn extract_reply(response: ChatResponse) -> Result<String, BackendError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| BackendError::MalformedResponse("no choices[0].message.content".to_string()))
}
