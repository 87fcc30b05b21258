// Daemon controller - wires the generation pipeline together
//
// Startup order matters:
// 1. prepare: wait for the mount, create the sessions directory, recover stale
//    sentinels (before any notification is processed)
// 2. the caller loads the backend, which may take a while
// 3. start: subscribe to the directory, spawn the worker pool, enqueue existing
//    session files so turns written while we were down get answered
// Shutdown cancels the watch loop, then drains queued and in-flight generations.

use crate::session::backend::Backend;
use crate::session::config::Config;
use crate::session::sentinel;
use crate::session::watcher::{scan_sessions, SessionWatcher};
use crate::session::worker::{GenerationParams, Generator, WorkItem};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// A started daemon; dropping it without `shutdown` leaves tasks running
pub struct RunningDaemon {
    cancel: CancellationToken,
    watch_task: JoinHandle<()>,
    workers: JoinSet<()>,
}

impl RunningDaemon {
    /// Token that stops the daemon when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the token is cancelled, then drain
    pub async fn wait(self) -> Result<()> {
        self.cancel.cancelled().await;
        self.drain().await
    }

    /// Cancel and drain
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.drain().await
    }

    async fn drain(mut self) -> Result<()> {
        self.watch_task.await.context("Watch loop panicked")?;
        let mut panicked = 0;
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Generation worker panicked");
                panicked += 1;
            }
        }
        if panicked > 0 {
            anyhow::bail!("{} generation worker(s) panicked", panicked);
        }
        tracing::info!("Daemon drained cleanly");
        Ok(())
    }
}

/// Make the sessions directory usable and unblock clients of interrupted generations.
///
/// Returns the ids whose stale sentinel was cleared.
pub async fn prepare(config: &Config) -> Result<Vec<String>> {
    config.wait_for_mount().await?;
    config
        .ensure_dirs()
        .await
        .context("Failed to create sessions directory")?;

    let sessions_dir = config.sessions_dir();
    tracing::info!(sessions_dir = %sessions_dir.display(), "Sessions directory ready");

    let recovered = sentinel::recover_stale(&sessions_dir)
        .await
        .context("Failed to recover stale sentinels")?;
    if !recovered.is_empty() {
        tracing::warn!(count = recovered.len(), "Recovered interrupted generations");
    }
    Ok(recovered)
}

/// Bring up the pipeline for a prepared sessions directory; returns once it is watching
pub async fn start(
    config: &Config,
    backend: Arc<dyn Backend>,
    cancel: CancellationToken,
) -> Result<RunningDaemon> {
    let sessions_dir = config.sessions_dir();
    let watcher = SessionWatcher::start(&sessions_dir)?;

    let (queue_tx, queue_rx) = mpsc::channel::<WorkItem>(config.queue_capacity);
    let generator = Arc::new(Generator::new(
        backend,
        sessions_dir.clone(),
        GenerationParams::from_config(config),
    ));
    let workers = generator.spawn_workers(config.workers, queue_rx, cancel.clone());

    // The subscription is live, so anything written from here on is also seen
    // by the watcher; duplicates are skipped by the workers.
    for item in scan_sessions(&sessions_dir).await? {
        if queue_tx.send(item).await.is_err() {
            break;
        }
    }

    let watch_task = tokio::spawn(watcher.run(queue_tx, cancel.clone()));

    tracing::info!(
        workers = config.workers,
        backend = generator.backend_name(),
        "Daemon started"
    );

    Ok(RunningDaemon {
        cancel,
        watch_task,
        workers,
    })
}
