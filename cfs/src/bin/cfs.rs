// cfs - talk to a cfs-daemon through a session file

use anyhow::{Context, Result};
use cfs_local_lib::session::client::{resolve_sessions_dir, ClientOptions, Session};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Conduct a conversation by appending to a session file.
#[derive(Parser)]
#[command(name = "cfs", version, about)]
struct Cli {
    /// Mount point of the shared filesystem
    #[arg(long, global = true, env = "CFS_MOUNT")]
    mount: Option<PathBuf>,

    /// Subdirectory of the mount holding session files
    #[arg(long, global = true, env = "CFS_SESSIONS_SUBDIR")]
    sessions_subdir: Option<String>,

    /// Sessions directory (overrides --mount and --sessions-subdir)
    #[arg(long, global = true)]
    sessions_dir: Option<PathBuf>,

    /// Seconds to wait for a reply
    #[arg(long, global = true, default_value_t = 120)]
    timeout_secs: u64,

    /// Milliseconds between polls of the session file
    #[arg(long, global = true, default_value_t = 100)]
    poll_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message and print the reply.
    Send {
        /// Existing or new session id (a fresh id is generated if omitted)
        #[arg(long)]
        session: Option<String>,

        /// The message (multiple words joined)
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },

    /// Send a message and print the reply as it is appended.
    Stream {
        #[arg(long)]
        session: Option<String>,

        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },

    /// Print the whole conversation.
    Read {
        #[arg(long)]
        session: String,
    },

    /// Remove a session file.
    Delete {
        #[arg(long)]
        session: String,
    },
}

impl Cli {
    fn sessions_dir(&self) -> PathBuf {
        if let Some(dir) = &self.sessions_dir {
            return dir.clone();
        }
        resolve_sessions_dir(self.mount.as_deref(), self.sessions_subdir.as_deref())
    }

    fn options(&self) -> ClientOptions {
        ClientOptions {
            poll_interval: Duration::from_millis(self.poll_ms.max(1)),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

fn main() -> Result<()> {
    cfs_local_lib::init_logging("warn");

    let cli = Cli::parse();
    let sessions_dir = cli.sessions_dir();
    let options = cli.options();

    match cli.command {
        Command::Send { session, message } => {
            let session = Session::open(session.as_deref(), &sessions_dir, options)?;
            eprintln!("session: {}", session.id());

            let response = session
                .send(&message.join(" "), None)
                .with_context(|| format!("Failed to send to session {}", session.id()))?;
            println!("{}", response.content());
            if response.is_error() {
                std::process::exit(1);
            }
        }
        Command::Stream { session, message } => {
            let session = Session::open(session.as_deref(), &sessions_dir, options)?;
            eprintln!("session: {}", session.id());

            let mut stdout = std::io::stdout().lock();
            for chunk in session.stream(&message.join(" "), None)? {
                stdout.write_all(chunk?.as_bytes())?;
                stdout.flush()?;
            }
        }
        Command::Read { session } => {
            let session = Session::from_file(&session, &sessions_dir, options)?;
            print!("{}", session.read()?);
        }
        Command::Delete { session } => {
            let session = Session::at(&session, &sessions_dir, options)?;
            session.delete()?;
        }
    }

    Ok(())
}
