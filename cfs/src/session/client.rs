// Session client - conducts a conversation through plain file operations
//
// The client shares nothing with the daemon but the session file and its
// sentinel. A turn is one append-and-close of `User: <msg>\n`; completion is
// detected by polling:
// - the sentinel was seen and is now gone, or
// - the file grew past our turn while no sentinel is present (generation
//   finished between two polls)

use crate::session::config::{DEFAULT_MOUNT, DEFAULT_SESSIONS_SUBDIR};
use crate::session::persistence::is_hidden_name;
use crate::session::protocol::{user_line, Response};
use crate::session::sentinel::sentinel_path;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Consecutive unchanged polls (with no sentinel) that end a stream
const STABLE_POLLS: u32 = 3;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The reply may still arrive later; nothing is cancelled daemon-side
    #[error("generation for session '{session_id}' did not complete within {waited:?}")]
    Timeout { session_id: String, waited: Duration },
    #[error("session '{session_id}' not found at {}", .path.display())]
    NotFound { session_id: String, path: PathBuf },
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),
    #[error("message must be a single line")]
    InvalidMessage,
}

/// Polling behaviour of a session
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub poll_interval: Duration,
    /// Used when a call passes no explicit timeout
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Sessions directory for an optional mount and subdirectory, with defaults
pub fn resolve_sessions_dir(mount: Option<&Path>, subdir: Option<&str>) -> PathBuf {
    let mount = mount
        .filter(|m| !m.as_os_str().is_empty())
        .unwrap_or(Path::new(DEFAULT_MOUNT));
    let subdir = subdir
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SESSIONS_SUBDIR);
    mount.join(subdir)
}

/// One conversation, backed by `<sessions_dir>/<session_id>`
#[derive(Debug, Clone)]
pub struct Session {
    session_id: String,
    session_path: PathBuf,
    sentinel_path: PathBuf,
    options: ClientOptions,
}

impl Session {
    /// Open (creating if absent) a session; `None` picks a fresh UUID v4 id
    pub fn open(
        session_id: Option<&str>,
        sessions_dir: &Path,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let session = Self::new(session_id, sessions_dir, options)?;
        fs::create_dir_all(sessions_dir)?;
        // Never truncate: the file is the conversation
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&session.session_path)?;
        Ok(session)
    }

    /// Open a session that must already exist
    pub fn from_file(
        session_id: &str,
        sessions_dir: &Path,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let session = Self::new(Some(session_id), sessions_dir, options)?;
        if !session.session_path.is_file() {
            return Err(ClientError::NotFound {
                session_id: session.session_id,
                path: session.session_path,
            });
        }
        Ok(session)
    }

    /// Refer to a session without touching the filesystem
    pub fn at(
        session_id: &str,
        sessions_dir: &Path,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        Self::new(Some(session_id), sessions_dir, options)
    }

    fn new(
        session_id: Option<&str>,
        sessions_dir: &Path,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        // Hidden names would be ignored by the daemon; separators escape the directory
        if is_hidden_name(&session_id) || session_id.contains(['/', '\\']) {
            return Err(ClientError::InvalidSessionId(session_id));
        }

        Ok(Self {
            session_path: sessions_dir.join(&session_id),
            sentinel_path: sentinel_path(sessions_dir, &session_id),
            session_id,
            options,
        })
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.session_path
    }

    /// Write a user turn and block until the daemon has answered it
    pub fn send(&self, message: &str, timeout: Option<Duration>) -> Result<Response, ClientError> {
        let size_before = self.append_user_message(message)?;
        self.wait_for_generation(size_before, timeout.unwrap_or(self.options.timeout))?;
        self.read_response()
    }

    /// Write a user turn and iterate over the text appended after it
    pub fn stream(
        &self,
        message: &str,
        timeout: Option<Duration>,
    ) -> Result<ReplyStream<'_>, ClientError> {
        let last_size = self.append_user_message(message)?;
        Ok(ReplyStream {
            session: self,
            last_size,
            deadline: Instant::now() + timeout.unwrap_or(self.options.timeout),
            stable_polls: 0,
            started: false,
            done: false,
        })
    }

    /// Full conversation text; empty if the file does not exist
    pub fn read(&self) -> Result<String, ClientError> {
        match fs::read_to_string(&self.session_path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_response(&self) -> Result<Response, ClientError> {
        Ok(Response::new(self.session_id.clone(), self.read()?))
    }

    /// Remove the session file; a missing file is not an error
    pub fn delete(&self) -> Result<(), ClientError> {
        match fs::remove_file(&self.session_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Nothing to release; the file stays behind for inspection
    pub fn close(self) {}

    /// Append the turn in one write and return the file size including it
    fn append_user_message(&self, message: &str) -> Result<u64, ClientError> {
        if message.contains(['\n', '\r']) {
            return Err(ClientError::InvalidMessage);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.session_path)?;
        file.write_all(user_line(message).as_bytes())?;
        // Measured before close: the daemon only reacts once the handle is closed
        let size = file.metadata()?.len();
        drop(file);
        Ok(size)
    }

    fn wait_for_generation(&self, size_before: u64, timeout: Duration) -> Result<(), ClientError> {
        let start = Instant::now();
        let mut seen_sentinel = false;

        while start.elapsed() < timeout {
            thread::sleep(self.options.poll_interval);

            if self.sentinel_path.exists() {
                seen_sentinel = true;
                continue;
            }
            if seen_sentinel {
                return Ok(());
            }
            match fs::metadata(&self.session_path) {
                Ok(meta) if meta.len() > size_before => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(session_id = %self.session_id, error = %e, "Transient read failure while polling");
                }
            }
        }

        Err(ClientError::Timeout {
            session_id: self.session_id.clone(),
            waited: timeout,
        })
    }

    fn read_range(&self, from: u64, to: u64) -> io::Result<Vec<u8>> {
        let mut file = File::open(&self.session_path)?;
        file.seek(SeekFrom::Start(from))?;
        let mut buf = Vec::with_capacity((to - from) as usize);
        file.take(to - from).read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Incremental reader returned by [`Session::stream`]
///
/// Yields each non-empty chunk appended after the user turn. Once the reply
/// has started (sentinel seen or text appended) it ends when no sentinel is
/// present and the size has not changed for a few polls. It also ends when
/// the file disappears or at the deadline.
pub struct ReplyStream<'a> {
    session: &'a Session,
    last_size: u64,
    deadline: Instant,
    stable_polls: u32,
    started: bool,
    done: bool,
}

impl ReplyStream<'_> {
    fn poll_once(&mut self) -> Result<Option<String>, ClientError> {
        let size = match fs::metadata(&self.session.session_path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.done = true;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut chunk = None;
        if size > self.last_size {
            let bytes = self.session.read_range(self.last_size, size)?;
            // Hold back a trailing partial UTF-8 sequence until the rest lands
            let valid = match std::str::from_utf8(&bytes) {
                Ok(_) => bytes.len(),
                Err(e) if e.error_len().is_none() => e.valid_up_to(),
                Err(_) => bytes.len(),
            };
            let text = String::from_utf8_lossy(&bytes[..valid]).into_owned();
            self.last_size += valid as u64;
            self.stable_polls = 0;
            self.started = true;
            if !text.is_empty() {
                chunk = Some(text);
            }
        } else {
            self.stable_polls += 1;
        }

        if self.session.sentinel_path.exists() {
            self.started = true;
        } else if self.started && self.stable_polls >= STABLE_POLLS {
            self.done = true;
        }
        Ok(chunk)
    }
}

impl Iterator for ReplyStream<'_> {
    type Item = Result<String, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done && Instant::now() < self.deadline {
            thread::sleep(self.session.options.poll_interval);
            match self.poll_once() {
                Ok(Some(chunk)) => return Some(Ok(chunk)),
                Ok(None) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
