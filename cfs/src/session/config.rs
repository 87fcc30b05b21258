// Environment configuration for the daemon
// Handles the mount layout, backend selection and generation parameters

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default mount point of the shared filesystem
pub const DEFAULT_MOUNT: &str = "/mnt/kvbfs";

/// Default subdirectory holding session files
pub const DEFAULT_SESSIONS_SUBDIR: &str = "sessions";

/// Characters budgeted per context token when trimming history
const CHARS_PER_TOKEN: usize = 3;

/// Errors that make the daemon refuse to start
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{0} must be set for the {1} backend")]
    MissingForBackend(&'static str, BackendKind),
    #[error("unknown backend: {0:?} (expected \"llamacpp\" or \"openai\")")]
    UnknownBackend(String),
    #[error("model not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Which text-generation backend the daemon drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Local GGUF model served by a `llama-server` child process
    LlamaCpp,
    /// Any OpenAI-compatible `/chat/completions` endpoint
    OpenAi,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::LlamaCpp => write!(f, "llamacpp"),
            BackendKind::OpenAi => write!(f, "openai"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llamacpp" => Ok(BackendKind::LlamaCpp),
            "openai" => Ok(BackendKind::OpenAi),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

/// Settings for the local model backend
#[derive(Debug, Clone)]
pub struct LocalModelConfig {
    pub model_path: Option<PathBuf>,
    pub n_gpu_layers: u32,
    /// `llama-server` executable (resolved through PATH when relative)
    pub server_bin: PathBuf,
    /// Loopback port the child server listens on
    pub port: u16,
}

/// Settings for the OpenAI-compatible backend
#[derive(Debug, Clone, Default)]
pub struct RemoteApiConfig {
    pub api_key: String,
    pub api_base: String,
    pub api_model: String,
}

/// Daemon configuration, built once at startup and passed to each component
#[derive(Debug, Clone)]
pub struct Config {
    /// Mount point of the shared filesystem
    pub mount: PathBuf,
    /// Subdirectory of `mount` containing session files
    pub sessions_subdir: String,
    pub backend: BackendKind,
    /// Context window of the model, in tokens
    pub n_ctx: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop: Vec<String>,
    /// Number of generation workers
    pub workers: usize,
    /// Capacity of the work queue between the watch loop and the workers
    pub queue_capacity: usize,
    /// How long to wait for the mount point to appear at startup
    pub mount_wait: Duration,
    pub local: LocalModelConfig,
    pub remote: RemoteApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mount: PathBuf::from(DEFAULT_MOUNT),
            sessions_subdir: DEFAULT_SESSIONS_SUBDIR.to_string(),
            backend: BackendKind::LlamaCpp,
            n_ctx: 4096,
            max_tokens: 512,
            temperature: 0.7,
            stop: vec!["User:".to_string()],
            workers: 1,
            queue_capacity: 64,
            mount_wait: Duration::from_secs(30),
            local: LocalModelConfig {
                model_path: None,
                n_gpu_layers: 0,
                server_bin: PathBuf::from("llama-server"),
                port: 8088,
            },
            remote: RemoteApiConfig::default(),
        }
    }
}

impl Config {
    /// Create configuration from `CFS_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(mount) = var("CFS_MOUNT") {
            config.mount = PathBuf::from(mount);
        }
        if let Some(subdir) = var("CFS_SESSIONS_SUBDIR") {
            config.sessions_subdir = subdir;
        }
        if let Some(backend) = var("CFS_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(n_ctx) = var("CFS_N_CTX") {
            config.n_ctx = parse_var("CFS_N_CTX", &n_ctx)?;
        }
        if let Some(max_tokens) = var("CFS_MAX_TOKENS") {
            config.max_tokens = parse_var("CFS_MAX_TOKENS", &max_tokens)?;
        }
        if let Some(temperature) = var("CFS_TEMPERATURE") {
            config.temperature = parse_var("CFS_TEMPERATURE", &temperature)?;
        }
        if let Some(stop) = lookup("CFS_STOP") {
            config.stop = parse_stop_list(&stop);
        }
        if let Some(workers) = var("CFS_WORKERS") {
            config.workers = parse_var("CFS_WORKERS", &workers)?;
        }
        if let Some(capacity) = var("CFS_QUEUE_CAPACITY") {
            config.queue_capacity = parse_var("CFS_QUEUE_CAPACITY", &capacity)?;
        }
        if let Some(secs) = var("CFS_MOUNT_WAIT_SECS") {
            config.mount_wait = Duration::from_secs(parse_var("CFS_MOUNT_WAIT_SECS", &secs)?);
        }

        config.local.model_path = var("CFS_MODEL_PATH").map(PathBuf::from);
        if let Some(layers) = var("CFS_N_GPU_LAYERS") {
            config.local.n_gpu_layers = parse_var("CFS_N_GPU_LAYERS", &layers)?;
        }
        if let Some(bin) = var("CFS_LLAMA_SERVER") {
            config.local.server_bin = PathBuf::from(bin);
        }
        if let Some(port) = var("CFS_LLAMA_PORT") {
            config.local.port = parse_var("CFS_LLAMA_PORT", &port)?;
        }

        config.remote = RemoteApiConfig {
            api_key: var("CFS_API_KEY").unwrap_or_default(),
            api_base: var("CFS_API_BASE").unwrap_or_default(),
            api_model: var("CFS_API_MODEL").unwrap_or_default(),
        };

        Ok(config)
    }

    /// Check that everything the selected backend needs is present
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mount.as_os_str().is_empty() {
            return Err(ConfigError::Missing("CFS_MOUNT"));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                var: "CFS_WORKERS",
                value: "0".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                var: "CFS_QUEUE_CAPACITY",
                value: "0".to_string(),
            });
        }

        match self.backend {
            BackendKind::LlamaCpp => {
                let model = self
                    .local
                    .model_path
                    .as_ref()
                    .ok_or(ConfigError::MissingForBackend("CFS_MODEL_PATH", self.backend))?;
                if !model.is_file() {
                    return Err(ConfigError::ModelNotFound(model.clone()));
                }
            }
            BackendKind::OpenAi => {
                let required = [
                    ("CFS_API_KEY", &self.remote.api_key),
                    ("CFS_API_BASE", &self.remote.api_base),
                    ("CFS_API_MODEL", &self.remote.api_model),
                ];
                for (var, value) in required {
                    if value.is_empty() {
                        return Err(ConfigError::MissingForBackend(var, self.backend));
                    }
                }
            }
        }

        Ok(())
    }

    /// Directory containing session files and sentinels
    pub fn sessions_dir(&self) -> PathBuf {
        self.mount.join(&self.sessions_subdir)
    }

    /// Character budget for a prompt, derived from the token context window
    pub fn context_chars(&self) -> usize {
        self.n_ctx.saturating_mul(CHARS_PER_TOKEN)
    }

    /// Wait until the mount point is a directory, polling every 2 seconds
    pub async fn wait_for_mount(&self) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + self.mount_wait;
        loop {
            if is_dir(&self.mount).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!(
                    "Mount point '{}' not available after {:?}",
                    self.mount.display(),
                    self.mount_wait
                );
            }
            tracing::info!(mount = %self.mount.display(), "Waiting for mount...");
            tokio::time::sleep(Duration::from_secs(2).min(self.mount_wait)).await;
        }
    }

    /// Ensure the sessions directory exists
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.sessions_dir()).await
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn parse_var<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

/// Split a comma-separated stop list, dropping empty entries
pub fn parse_stop_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
