use anyhow::{Context, Result};
use cfs_local_lib::session::backend::Backend;
use cfs_local_lib::session::client::ClientOptions;
use cfs_local_lib::session::config::{BackendKind, Config};
use cfs_local_lib::session::daemon::{self, RunningDaemon};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

/// RAII wrapper that runs the daemon pipeline in-process and drains it on drop.
pub struct DaemonGuard {
    running: Option<RunningDaemon>,
    runtime: Runtime,
    sessions_dir: PathBuf,
}

/// Configuration pointing at `mount`, with no real backend settings
pub fn test_config(mount: &Path) -> Config {
    Config {
        mount: mount.to_path_buf(),
        backend: BackendKind::OpenAi,
        workers: 2,
        mount_wait: Duration::from_millis(200),
        ..Config::default()
    }
}

/// Client options with a short poll interval and a bounded wait
pub fn client_options() -> ClientOptions {
    ClientOptions {
        poll_interval: Duration::from_millis(20),
        timeout: Duration::from_secs(10),
    }
}

impl DaemonGuard {
    /// Recover, start watching `<mount>/sessions` and return once events are being handled.
    pub fn start(mount: &Path, backend: Arc<dyn Backend>) -> Result<Self> {
        let config = test_config(mount);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("Failed to build test runtime")?;

        let running = runtime.block_on(async {
            daemon::prepare(&config).await?;
            daemon::start(&config, backend, CancellationToken::new()).await
        })?;

        Ok(Self {
            running: Some(running),
            runtime,
            sessions_dir: config.sessions_dir(),
        })
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Cancel, drain and report whether every task exited cleanly
    pub fn stop(mut self) -> Result<()> {
        match self.running.take() {
            Some(running) => self.runtime.block_on(running.shutdown()),
            None => Ok(()),
        }
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            if let Err(err) = self.runtime.block_on(running.shutdown()) {
                eprintln!("Daemon did not shut down cleanly: {:#}", err);
            }
        }
    }
}
