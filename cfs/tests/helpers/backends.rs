use async_trait::async_trait;
use cfs_local_lib::session::backend::{Backend, BackendError};
use std::time::Duration;

fn last_user_message(prompt: &str) -> &str {
    prompt
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix("User: "))
        .unwrap_or("")
}

/// Replies `Echo: <last user message>`, optionally after a delay
pub struct EchoBackend {
    pub delay: Duration,
}

impl EchoBackend {
    pub fn instant() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Backend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(
        &self,
        prompt: &str,
        _max_tokens: u32,
        _temperature: f32,
        _stop: &[String],
    ) -> Result<String, BackendError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(format!("Echo: {}", last_user_message(prompt)))
    }
}

/// Fails every call with an API error
pub struct BrokenBackend;

#[async_trait]
impl Backend for BrokenBackend {
    fn name(&self) -> &str {
        "broken"
    }

    async fn generate(
        &self,
        _prompt: &str,
        _max_tokens: u32,
        _temperature: f32,
        _stop: &[String],
    ) -> Result<String, BackendError> {
        Err(BackendError::Api {
            status: 503,
            body: "overloaded".to_string(),
        })
    }
}
