// Generation worker pool
//
// Workers drain one shared bounded queue of WorkItems. For each item:
// - re-read the session file and skip it unless a reply is owed
// - create the sentinel, trim + build the prompt, call the backend
// - append the reply (or an in-band error reply), remove the sentinel
//
// A per-session lock serializes work on the same session id across workers.

use crate::session::backend::Backend;
use crate::session::config::Config;
use crate::session::persistence;
use crate::session::protocol::{
    assistant_line, build_prompt, error_reply, needs_response, trim_to_context,
};
use crate::session::sentinel;
use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A session that may owe a reply; the file is re-read when processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub path: PathBuf,
    pub session_id: String,
}

impl WorkItem {
    pub fn new(path: PathBuf, session_id: impl Into<String>) -> Self {
        Self {
            path,
            session_id: session_id.into(),
        }
    }
}

/// What processing a work item did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No reply was owed (already answered or duplicate notification)
    Skipped,
    /// The backend reply was appended
    Replied,
    /// The backend failed and an error reply was appended
    ErrorReply,
}

/// Sampling parameters passed to every backend call
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub stop: Vec<String>,
    /// Prompt budget in characters
    pub context_chars: usize,
}

impl GenerationParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            stop: config.stop.clone(),
            context_chars: config.context_chars(),
        }
    }
}

/// Shared state of the worker pool
pub struct Generator {
    backend: Arc<dyn Backend>,
    sessions_dir: PathBuf,
    params: GenerationParams,
    /// Per-session exclusion (session id -> lock), pruned when unused
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Generator {
    pub fn new(backend: Arc<dyn Backend>, sessions_dir: PathBuf, params: GenerationParams) -> Self {
        Self {
            backend,
            sessions_dir,
            params,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Spawn `workers` tasks consuming `queue` until it closes or `cancel` fires.
    ///
    /// On cancellation each worker finishes its current item and then drains
    /// whatever is still queued before exiting.
    pub fn spawn_workers(
        self: &Arc<Self>,
        workers: usize,
        queue: mpsc::Receiver<WorkItem>,
        cancel: CancellationToken,
    ) -> JoinSet<()> {
        let queue = Arc::new(Mutex::new(queue));
        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let generator = Arc::clone(self);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            set.spawn(async move {
                generator.worker_loop(worker_id, queue, cancel).await;
            });
        }
        set
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        queue: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
        cancel: CancellationToken,
    ) {
        tracing::debug!(worker_id, "Generation worker started");
        loop {
            let item = {
                let mut rx = queue.lock().await;
                let received = if cancel.is_cancelled() {
                    None
                } else {
                    tokio::select! {
                        biased;
                        item = rx.recv() => Some(item),
                        _ = cancel.cancelled() => None,
                    }
                };
                // Once cancelled, only take what is already queued
                match received {
                    Some(item) => item,
                    None => rx.try_recv().ok(),
                }
            };

            let Some(item) = item else {
                break;
            };

            if let Err(e) = self.process_session(&item).await {
                tracing::error!(session_id = %item.session_id, error = %e, "Unhandled error");
            }
        }
        tracing::debug!(worker_id, "Generation worker stopped");
    }

    /// Generate and append a reply for one session if it still owes one
    pub async fn process_session(&self, item: &WorkItem) -> Result<ProcessOutcome> {
        let lock = self.session_lock(&item.session_id).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.process_locked(item).await
        };
        self.release_session_lock(&item.session_id, lock).await;
        outcome
    }

    async fn process_locked(&self, item: &WorkItem) -> Result<ProcessOutcome> {
        let content = persistence::read_session(&item.path).await?;
        if !needs_response(&content) {
            tracing::debug!(session_id = %item.session_id, "No reply owed, skipping");
            return Ok(ProcessOutcome::Skipped);
        }

        if let Err(e) = sentinel::create(&self.sessions_dir, &item.session_id).await {
            // Still owe the client a terminal state for this turn
            tracing::error!(session_id = %item.session_id, error = %e, "Failed to create sentinel");
            persistence::append(&item.path, &assistant_line(&error_reply(&format!("{:#}", e))))
                .await?;
            return Ok(ProcessOutcome::ErrorReply);
        }

        let (reply, outcome) = match self.generate(&content).await {
            Ok(text) => (text, ProcessOutcome::Replied),
            Err(message) => {
                tracing::error!(session_id = %item.session_id, error = %message, "Generation failed");
                (error_reply(&message), ProcessOutcome::ErrorReply)
            }
        };

        let appended = persistence::append(&item.path, &assistant_line(&reply)).await;
        let removed = sentinel::remove(&self.sessions_dir, &item.session_id).await;
        appended?;
        removed?;

        if outcome == ProcessOutcome::Replied {
            tracing::info!(
                session_id = %item.session_id,
                backend = self.backend.name(),
                "Generated response"
            );
        }
        Ok(outcome)
    }

    async fn generate(&self, content: &str) -> Result<String, String> {
        let prompt = build_prompt(&trim_to_context(content, self.params.context_chars));
        self.backend
            .generate(
                &prompt,
                self.params.max_tokens,
                self.params.temperature,
                &self.params.stop,
            )
            .await
            .map_err(|e| e.to_string())
    }

    async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    async fn release_session_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.session_locks.lock().await;
        drop(lock);
        // Clones are only handed out under the map lock, so a count of one
        // means no other worker holds or waits on this session.
        if locks
            .get(session_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(session_id);
        }
    }

    #[cfg(test)]
    async fn tracked_sessions(&self) -> usize {
        self.session_locks.lock().await.len()
    }
}
