//! Text-generation backends.
//!
//! The worker pool only sees the [`Backend`] capability. Concrete backends form
//! a closed set ([`AnyBackend`]) chosen once at startup by [`load_backend`].

pub mod llamacpp;
pub mod openai;

use crate::session::config::{BackendKind, Config};
use async_trait::async_trait;
use thiserror::Error;

pub use llamacpp::LlamaCppBackend;
pub use openai::OpenAiBackend;

/// Failure of a single generation call (or of backend startup)
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API request failed ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("failed to start {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("model server at {url} not ready after {waited_secs}s")]
    NotReady { url: String, waited_secs: u64 },
}

/// A stateless text-generation capability
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Continue `prompt`, stopping at `max_tokens` or any `stop` sequence
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        stop: &[String],
    ) -> Result<String, BackendError>;
}

/// Every backend the daemon can be configured with
pub enum AnyBackend {
    LlamaCpp(LlamaCppBackend),
    OpenAi(OpenAiBackend),
}

#[async_trait]
impl Backend for AnyBackend {
    fn name(&self) -> &str {
        match self {
            AnyBackend::LlamaCpp(b) => b.name(),
            AnyBackend::OpenAi(b) => b.name(),
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        stop: &[String],
    ) -> Result<String, BackendError> {
        match self {
            AnyBackend::LlamaCpp(b) => b.generate(prompt, max_tokens, temperature, stop).await,
            AnyBackend::OpenAi(b) => b.generate(prompt, max_tokens, temperature, stop).await,
        }
    }
}

/// Create the backend selected by `config`.
///
/// The configuration must already be validated.
pub async fn load_backend(config: &Config) -> Result<AnyBackend, BackendError> {
    match config.backend {
        BackendKind::LlamaCpp => Ok(AnyBackend::LlamaCpp(
            LlamaCppBackend::start(&config.local, config.n_ctx).await?,
        )),
        BackendKind::OpenAi => Ok(AnyBackend::OpenAi(OpenAiBackend::new(&config.remote)?)),
    }
}
