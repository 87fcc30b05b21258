//! Test utilities for async daemon tests
//!
//! Stub backends plus a polling assertion that avoids arbitrary sleeps.

use crate::session::backend::{Backend, BackendError};
use crate::session::protocol::USER_PREFIX;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Text of the last `User: ` line of a prompt
fn last_user_message(prompt: &str) -> &str {
    prompt
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(USER_PREFIX))
        .unwrap_or("")
}

/// Replies `Echo: <last user message>`
pub struct EchoBackend;

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
        Ok(format!("Echo: {}", last_user_message(prompt)))
    }
}

/// Replies with the same text every time
pub struct FixedBackend {
    reply: String,
}

impl FixedBackend {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
        }
    }
}

#[async_trait]
impl Backend for FixedBackend {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn generate(
        &self,
        _prompt: &str,
        _max_tokens: u32,
        _temperature: f32,
        _stop: &[String],
    ) -> Result<String, BackendError> {
        Ok(self.reply.clone())
    }
}

/// Always fails with a malformed-response error
pub struct FailingBackend {
    message: String,
}

impl FailingBackend {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Backend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    async fn generate(
        &self,
        _prompt: &str,
        _max_tokens: u32,
        _temperature: f32,
        _stop: &[String],
    ) -> Result<String, BackendError> {
        Err(BackendError::MalformedResponse(self.message.clone()))
    }
}

/// Sleeps before replying `slow reply`; counts calls
pub struct SlowBackend {
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for SlowBackend {
    fn name(&self) -> &str {
        "slow"
    }

    async fn generate(
        &self,
        _prompt: &str,
        _max_tokens: u32,
        _temperature: f32,
        _stop: &[String],
    ) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok("slow reply".to_string())
    }
}

/// Assert that an async condition becomes true within `timeout`, checking
/// every `interval`.
pub async fn assert_eventually_bool<F, Fut>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        if f().await {
            return;
        }

        if start.elapsed() >= timeout {
            panic!(
                "Timeout waiting for {}\nDuration: {:?}\nAttempts: {}",
                desc,
                start.elapsed(),
                attempt
            );
        }

        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_backend_uses_last_user_line() {
        let reply = EchoBackend
            .generate("User: one\nAssistant: x\nUser: two\nAssistant: ", 8, 0.0, &[])
            .await
            .unwrap();
        assert_eq!(reply, "Echo: two");
    }

    #[tokio::test]
    #[should_panic(expected = "Timeout waiting for never true")]
    async fn test_assert_eventually_bool_times_out() {
        assert_eventually_bool(
            "never true",
            Duration::from_millis(100),
            Duration::from_millis(20),
            || async { false },
        )
        .await;
    }
}
