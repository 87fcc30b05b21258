// cfs-daemon - answers conversation turns appended to session files
//
// Configuration comes from CFS_* environment variables; flags override them.

use anyhow::{Context, Result};
use cfs_local_lib::session::backend::{load_backend, Backend};
use cfs_local_lib::session::config::{BackendKind, Config};
use cfs_local_lib::session::daemon;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Watch a sessions directory and generate replies to new user turns.
#[derive(Parser, Debug)]
#[command(name = "cfs-daemon", version, about)]
struct Args {
    /// Mount point of the shared filesystem
    #[arg(long, env = "CFS_MOUNT")]
    mount: Option<PathBuf>,

    /// Subdirectory of the mount holding session files
    #[arg(long, env = "CFS_SESSIONS_SUBDIR")]
    sessions_subdir: Option<String>,

    /// Backend to drive: llamacpp or openai
    #[arg(long, env = "CFS_BACKEND")]
    backend: Option<String>,

    /// Context window in tokens
    #[arg(long, env = "CFS_N_CTX")]
    n_ctx: Option<usize>,

    /// Maximum tokens per reply
    #[arg(long, env = "CFS_MAX_TOKENS")]
    max_tokens: Option<u32>,

    /// Sampling temperature
    #[arg(long, env = "CFS_TEMPERATURE")]
    temperature: Option<f32>,

    /// Generation workers
    #[arg(long, env = "CFS_WORKERS")]
    workers: Option<usize>,

    /// GGUF model for the llamacpp backend
    #[arg(long, env = "CFS_MODEL_PATH")]
    model_path: Option<PathBuf>,

    /// Layers offloaded to the GPU (llamacpp)
    #[arg(long, env = "CFS_N_GPU_LAYERS")]
    n_gpu_layers: Option<u32>,

    /// API key (openai)
    #[arg(long, env = "CFS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// API base URL, e.g. https://api.openai.com/v1 (openai)
    #[arg(long, env = "CFS_API_BASE")]
    api_base: Option<String>,

    /// Model name (openai)
    #[arg(long, env = "CFS_API_MODEL")]
    api_model: Option<String>,
}

impl Args {
    /// Overlay every flag that was given onto `config`
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(mount) = self.mount {
            config.mount = mount;
        }
        if let Some(subdir) = self.sessions_subdir {
            config.sessions_subdir = subdir;
        }
        if let Some(backend) = self.backend {
            config.backend = backend.parse::<BackendKind>()?;
        }
        if let Some(n_ctx) = self.n_ctx {
            config.n_ctx = n_ctx;
        }
        if let Some(max_tokens) = self.max_tokens {
            config.max_tokens = max_tokens;
        }
        if let Some(temperature) = self.temperature {
            config.temperature = temperature;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(model_path) = self.model_path {
            config.local.model_path = Some(model_path);
        }
        if let Some(n_gpu_layers) = self.n_gpu_layers {
            config.local.n_gpu_layers = n_gpu_layers;
        }
        if let Some(api_key) = self.api_key {
            config.remote.api_key = api_key;
        }
        if let Some(api_base) = self.api_base {
            config.remote.api_base = api_base.trim_end_matches('/').to_string();
        }
        if let Some(api_model) = self.api_model {
            config.remote.api_model = api_model;
        }
        Ok(())
    }
}

fn load_config() -> Result<Config> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    args.apply(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    cfs_local_lib::init_logging("info");

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(2);
        }
    };

    tracing::info!(
        backend = %config.backend,
        mount = %config.mount.display(),
        "Starting cfs-daemon"
    );

    daemon::prepare(&config).await?;

    let backend = load_backend(&config)
        .await
        .context("Failed to load backend")?;
    let backend: Arc<dyn Backend> = Arc::new(backend);

    let cancel = CancellationToken::new();
    let running = daemon::start(&config, backend, cancel.clone()).await?;

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutting down daemon...");
        signal_cancel.cancel();
    });

    running.wait().await?;
    tracing::info!("Daemon stopped");
    Ok(())
}
