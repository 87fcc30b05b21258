use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A session file never reached the expected state.
#[derive(Debug)]
pub struct WaitError {
    path: PathBuf,
    waited: Duration,
    last_content: Option<String>,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timed out after {:?} waiting for {}. Last content: {:?}",
            self.waited,
            self.path.display(),
            self.last_content.as_deref().unwrap_or("<missing>")
        )
    }
}

impl std::error::Error for WaitError {}

/// Poll a session file until `predicate` accepts its content.
pub fn wait_for_session<F>(path: &Path, predicate: F, timeout: Duration) -> Result<String, WaitError>
where
    F: Fn(&str) -> bool,
{
    let start = Instant::now();
    let mut last_content = None;

    loop {
        if let Ok(content) = fs::read_to_string(path) {
            if predicate(&content) {
                return Ok(content);
            }
            last_content = Some(content);
        }

        if start.elapsed() >= timeout {
            return Err(WaitError {
                path: path.to_path_buf(),
                waited: start.elapsed(),
                last_content,
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Poll until `path` no longer exists.
pub fn wait_for_removal(path: &Path, timeout: Duration) -> bool {
    let start = Instant::now();
    while path.exists() {
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
    true
}
