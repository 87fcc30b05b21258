// Watch loop - turns sessions-directory notifications into work items
//
// Only "closed after write" and "moved into the directory" events matter: a
// client appends a turn and closes the file. The loop is a cheap stateless
// filter; deciding whether a reply is owed is the worker's job.

use crate::session::persistence::{is_hidden_name, is_regular_file};
use crate::session::worker::WorkItem;
use anyhow::{Context, Result};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A live subscription on the sessions directory
pub struct SessionWatcher {
    sessions_dir: PathBuf,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    // Dropping the watcher ends the subscription
    _watcher: RecommendedWatcher,
}

impl SessionWatcher {
    /// Subscribe to `sessions_dir` (non-recursive)
    pub fn start(sessions_dir: &Path) -> Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Receiver gone means the loop has stopped
            let _ = tx.send(res);
        })
        .context("Failed to create filesystem watcher")?;

        watcher
            .watch(sessions_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", sessions_dir.display()))?;

        tracing::info!(sessions_dir = %sessions_dir.display(), "Watching for session file changes");

        Ok(Self {
            sessions_dir: sessions_dir.to_path_buf(),
            events,
            _watcher: watcher,
        })
    }

    /// Forward notifications into `queue` until `cancel` fires or the queue closes
    pub async fn run(mut self, queue: mpsc::Sender<WorkItem>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => event,
            };

            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Watcher error");
                    continue;
                }
                None => break,
            };

            let items = if event.need_rescan() {
                tracing::warn!("Watcher dropped events, rescanning sessions directory");
                match scan_sessions(&self.sessions_dir).await {
                    Ok(items) => items,
                    Err(e) => {
                        tracing::error!(error = %e, "Rescan failed");
                        continue;
                    }
                }
            } else {
                work_items(&self.sessions_dir, &event).await
            };

            for item in items {
                tracing::debug!(session_id = %item.session_id, "Event on session, enqueuing");
                let sent = tokio::select! {
                    _ = cancel.cancelled() => false,
                    sent = queue.send(item) => sent.is_ok(),
                };
                if !sent {
                    return;
                }
            }
        }
        tracing::debug!("Watch loop stopped");
    }
}

/// Whether an event means a writer finished with the entry
pub fn is_write_complete(kind: &EventKind) -> bool {
    match kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both)) => true,
        // Backends without close notifications (FSEvents, kqueue, polling)
        // report content changes instead
        #[cfg(not(target_os = "linux"))]
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => true,
        _ => false,
    }
}

/// Work items for the session files named by `event`
pub async fn work_items(sessions_dir: &Path, event: &Event) -> Vec<WorkItem> {
    if !is_write_complete(&event.kind) {
        return Vec::new();
    }

    // A two-path rename lists [from, to]; only the destination is new
    let paths: &[PathBuf] = match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.last().map(std::slice::from_ref).unwrap_or(&[])
        }
        _ => &event.paths,
    };

    let mut items = Vec::new();
    for path in paths {
        if let Some(item) = work_item_for(sessions_dir, path).await {
            items.push(item);
        }
    }
    items
}

/// Map one entry of the sessions directory to a work item, filtering decoys
pub async fn work_item_for(sessions_dir: &Path, path: &Path) -> Option<WorkItem> {
    let name = path.file_name()?.to_str()?;
    if is_hidden_name(name) {
        return None;
    }
    let session_path = sessions_dir.join(name);
    if !is_regular_file(&session_path).await {
        return None;
    }
    Some(WorkItem::new(session_path, name))
}

/// Enumerate every candidate session file currently in the directory
pub async fn scan_sessions(sessions_dir: &Path) -> Result<Vec<WorkItem>> {
    let mut entries = tokio::fs::read_dir(sessions_dir)
        .await
        .with_context(|| format!("Failed to list sessions dir: {}", sessions_dir.display()))?;

    let mut items = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(item) = work_item_for(sessions_dir, &entry.path()).await {
            items.push(item);
        }
    }
    items.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn close_write(path: PathBuf) -> Event {
        Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write))).add_path(path)
    }

    #[tokio::test]
    async fn test_close_write_on_session_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("chat");
        std::fs::write(&path, "User: hi\n").unwrap();

        let items = work_items(temp_dir.path(), &close_write(path.clone())).await;
        assert_eq!(items, vec![WorkItem::new(path, "chat")]);
    }

    #[tokio::test]
    async fn test_decoys_are_filtered() {
        let temp_dir = TempDir::new().unwrap();
        let sentinel = temp_dir.path().join(".generating.chat");
        std::fs::write(&sentinel, "").unwrap();
        let subdir = temp_dir.path().join("nested");
        std::fs::create_dir(&subdir).unwrap();
        let missing = temp_dir.path().join("deleted-already");

        for path in [sentinel, subdir, missing] {
            let items = work_items(temp_dir.path(), &close_write(path.clone())).await;
            assert!(items.is_empty(), "{} should be ignored", path.display());
        }
    }

    #[tokio::test]
    async fn test_rename_uses_destination() {
        let temp_dir = TempDir::new().unwrap();
        let dest = temp_dir.path().join("chat");
        std::fs::write(&dest, "User: hi\n").unwrap();

        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(temp_dir.path().join(".chat.tmp"))
            .add_path(dest.clone());

        let items = work_items(temp_dir.path(), &event).await;
        assert_eq!(items, vec![WorkItem::new(dest, "chat")]);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_open_and_remove_events_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("chat");
        std::fs::write(&path, "User: hi\n").unwrap();

        for kind in [
            EventKind::Access(AccessKind::Open(AccessMode::Any)),
            EventKind::Remove(notify::event::RemoveKind::File),
            EventKind::Create(notify::event::CreateKind::File),
        ] {
            let event = Event::new(kind).add_path(path.clone());
            assert!(work_items(temp_dir.path(), &event).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_rescan_flag_enqueues_every_session() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a"), "User: one\n").unwrap();
        std::fs::write(temp_dir.path().join("b"), "User: two\n").unwrap();

        let (events_tx, events) = mpsc::unbounded_channel();
        let watcher = SessionWatcher {
            sessions_dir: temp_dir.path().to_path_buf(),
            events,
            _watcher: notify::recommended_watcher(|_: notify::Result<Event>| {}).unwrap(),
        };
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher.run(tx, cancel.clone()));

        events_tx
            .send(Ok(Event::new(EventKind::Other).set_flag(notify::event::Flag::Rescan)))
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.session_id.as_str(), second.session_id.as_str()), ("a", "b"));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_sessions() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("b"), "User: hi\n").unwrap();
        std::fs::write(temp_dir.path().join("a"), "").unwrap();
        std::fs::write(temp_dir.path().join(".generating.a"), "").unwrap();

        let ids: Vec<String> = scan_sessions(temp_dir.path())
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.session_id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_watch_loop_enqueues_appended_session() {
        let temp_dir = TempDir::new().unwrap();
        let watcher = SessionWatcher::start(temp_dir.path()).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher.run(tx, cancel.clone()));

        std::fs::write(temp_dir.path().join(".generating.chat"), "").unwrap();
        std::fs::write(temp_dir.path().join("chat"), "User: hi\n").unwrap();

        let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watch loop should enqueue the session")
            .unwrap();
        assert_eq!(item.session_id, "chat");

        cancel.cancel();
        task.await.unwrap();
    }
}
