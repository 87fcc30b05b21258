// Session file I/O used by the daemon
// Session files are append-only: every write is one append of complete lines

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Append `text` to the file in a single write, then close it.
///
/// Closing the handle is what emits the close-after-write notification, so
/// callers must pass whole lines (newline included).
pub async fn append(path: &Path, text: &str) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open session file for append: {}", path.display()))?;

    file.write_all(text.as_bytes())
        .await
        .with_context(|| format!("Failed to append to session file: {}", path.display()))?;
    file.flush().await?;

    Ok(())
}

/// Read the full session file as UTF-8
pub async fn read_session(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read session file: {}", path.display()))
}

/// Returns true for entry names that can never be session files
///
/// Sentinels, editor swap files and other dotfiles are all hidden entries.
pub fn is_hidden_name(name: &str) -> bool {
    name.is_empty() || name.starts_with('.')
}

/// Returns true if `path` is a regular file (symlinks are followed)
pub async fn is_regular_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
