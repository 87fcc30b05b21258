// cfs-local: conversations with a language model driven purely by file operations
//
// A client appends `User: ...` to a session file; the daemon notices the
// close-after-write, generates a reply through a pluggable backend and appends
// `Assistant: ...` to the same file.

// Session protocol, daemon pipeline and client (shared between both binaries)
pub mod session;

// Async test helpers (unit tests only)
#[cfg(test)]
pub(crate) mod test_utils;

/// Install the stderr `tracing` subscriber used by both binaries.
///
/// The filter is read from `CFS_LOG` (e.g. `CFS_LOG=debug`), falling back to
/// `default_level`.
pub fn init_logging(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_env("CFS_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
