// Sentinel store - `.generating.<id>` marker files
//
// A sentinel exists while a worker owns generation for a session. Clients poll
// for it to detect completion; a sentinel surviving a restart marks a turn
// that was interrupted mid-generation.

use crate::session::persistence;
use crate::session::protocol::{assistant_line, RESTART_ERROR};
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// File name prefix shared by every sentinel
pub const SENTINEL_PREFIX: &str = ".generating.";

/// Path of the sentinel for `session_id`
pub fn sentinel_path(sessions_dir: &Path, session_id: &str) -> PathBuf {
    sessions_dir.join(format!("{}{}", SENTINEL_PREFIX, session_id))
}

/// Session id encoded in a sentinel file name, if it is one
pub fn session_id_from_name(name: &str) -> Option<&str> {
    name.strip_prefix(SENTINEL_PREFIX)
}

/// Create (or truncate) the sentinel for `session_id`
pub async fn create(sessions_dir: &Path, session_id: &str) -> Result<()> {
    let path = sentinel_path(sessions_dir, session_id);
    tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("Failed to create sentinel: {}", path.display()))?;
    Ok(())
}

/// Delete the sentinel for `session_id`; a missing sentinel is not an error
pub async fn remove(sessions_dir: &Path, session_id: &str) -> Result<()> {
    let path = sentinel_path(sessions_dir, session_id);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("Failed to remove sentinel: {}", path.display()))
        }
    }
}

/// Clean up sentinels left behind by a previous daemon.
///
/// Each interrupted session receives a restart error reply so a waiting client
/// sees a terminal state, then the sentinel is removed. Must run before the
/// watch loop starts. Returns the recovered session ids.
pub async fn recover_stale(sessions_dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(sessions_dir)
        .await
        .with_context(|| format!("Failed to list sessions dir: {}", sessions_dir.display()))?;

    let mut recovered = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(session_id) = name.to_str().and_then(session_id_from_name) else {
            continue;
        };

        let session_file = sessions_dir.join(session_id);
        if !session_id.is_empty() && persistence::is_regular_file(&session_file).await {
            persistence::append(&session_file, &assistant_line(RESTART_ERROR)).await?;
        }
        remove(sessions_dir, session_id).await?;

        tracing::warn!(session_id, "Cleaned stale sentinel");
        recovered.push(session_id.to_string());
    }

    recovered.sort();
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sentinel_path() {
        let path = sentinel_path(Path::new("/mnt/kvbfs/sessions"), "abc");
        assert_eq!(path, PathBuf::from("/mnt/kvbfs/sessions/.generating.abc"));
        assert_eq!(session_id_from_name(".generating.abc"), Some("abc"));
        assert_eq!(session_id_from_name("abc"), None);
    }

    #[tokio::test]
    async fn test_create_then_remove() {
        let temp_dir = TempDir::new().unwrap();
        let path = sentinel_path(temp_dir.path(), "s1");

        create(temp_dir.path(), "s1").await.unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        // Creating over an existing sentinel is fine
        create(temp_dir.path(), "s1").await.unwrap();

        remove(temp_dir.path(), "s1").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        remove(temp_dir.path(), "never-created").await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_stale_appends_error_turn() {
        let temp_dir = TempDir::new().unwrap();
        let session = temp_dir.path().join("s1");
        std::fs::write(&session, "User: hello\n").unwrap();
        create(temp_dir.path(), "s1").await.unwrap();

        let recovered = recover_stale(temp_dir.path()).await.unwrap();

        assert_eq!(recovered, vec!["s1".to_string()]);
        let content = std::fs::read_to_string(&session).unwrap();
        assert_eq!(
            content,
            "User: hello\nAssistant: [Error: Daemon restarted during generation]\n"
        );
        assert!(!sentinel_path(temp_dir.path(), "s1").exists());
    }

    #[tokio::test]
    async fn test_recover_stale_without_session_file() {
        let temp_dir = TempDir::new().unwrap();
        create(temp_dir.path(), "gone").await.unwrap();
        std::fs::write(temp_dir.path().join("untouched"), "User: hi\n").unwrap();

        let recovered = recover_stale(temp_dir.path()).await.unwrap();

        assert_eq!(recovered, vec!["gone".to_string()]);
        assert!(!temp_dir.path().join("gone").exists());
        assert!(!sentinel_path(temp_dir.path(), "gone").exists());
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("untouched")).unwrap(),
            "User: hi\n"
        );
    }
}
