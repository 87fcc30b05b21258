//! Local GGUF inference through a `llama-server` child process.
//!
//! The daemon owns the child: it is spawned with the configured model, context
//! size and GPU offload, health-checked before the first request, and killed
//! when the backend is dropped. Prompts go to the raw `/completion` endpoint so
//! the conversation text reaches the model verbatim.

use super::{Backend, BackendError};
use crate::session::config::LocalModelConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Model loading can take a while for large GGUF files
const READY_TIMEOUT: Duration = Duration::from_secs(300);
const READY_POLL: Duration = Duration::from_millis(500);

#[derive(Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
    temperature: f32,
    stop: &'a [String],
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    content: String,
}

pub struct LlamaCppBackend {
    client: reqwest::Client,
    base_url: String,
    // Held for kill_on_drop
    _server: Child,
}

impl LlamaCppBackend {
    /// Spawn `llama-server` for the configured model and wait until it is healthy
    pub async fn start(config: &LocalModelConfig, n_ctx: usize) -> Result<Self, BackendError> {
        let bin = config.server_bin.display().to_string();
        let model = config
            .model_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        tracing::info!(model = %model, server = %bin, "Loading model...");

        let server = Command::new(&config.server_bin)
            .args(server_args(config, n_ctx))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackendError::Spawn { bin, source })?;

        let backend = Self {
            client: reqwest::Client::new(),
            base_url: format!("http://127.0.0.1:{}", config.port),
            _server: server,
        };
        backend.wait_until_ready().await?;

        tracing::info!(base_url = %backend.base_url, "Model loaded successfully");
        Ok(backend)
    }

    async fn wait_until_ready(&self) -> Result<(), BackendError> {
        let url = format!("{}/health", self.base_url);
        let start = std::time::Instant::now();

        while start.elapsed() < READY_TIMEOUT {
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                // 503 while the model is still loading, connection refused before bind
                Ok(_) | Err(_) => tokio::time::sleep(READY_POLL).await,
            }
        }

        Err(BackendError::NotReady {
            url,
            waited_secs: READY_TIMEOUT.as_secs(),
        })
    }
}

fn server_args(config: &LocalModelConfig, n_ctx: usize) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(model) = &config.model_path {
        args.push("-m".to_string());
        args.push(model.display().to_string());
    }
    args.extend([
        "-c".to_string(),
        n_ctx.to_string(),
        "-ngl".to_string(),
        config.n_gpu_layers.to_string(),
        "--host".to_string(),
        "127.0.0.1".to_string(),
        "--port".to_string(),
        config.port.to_string(),
    ]);
    args
}

#[async_trait]
impl Backend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llamacpp"
    }

    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        stop: &[String],
    ) -> Result<String, BackendError> {
        let request = CompletionRequest {
            prompt,
            n_predict: max_tokens,
            temperature,
            stop,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/completion", self.base_url))
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

        let parsed: CompletionResponse = response.json().await?;
        Ok(parsed.content.trim().to_string())
    }
}
