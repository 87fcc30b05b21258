// Conversation protocol - the line format shared by the daemon and the client
// Session files are UTF-8 text, one `User: ` / `Assistant: ` line per turn

/// Prefix of a user turn
pub const USER_PREFIX: &str = "User: ";

/// Prefix of an assistant turn
pub const ASSISTANT_PREFIX: &str = "Assistant: ";

/// Generation cue appended to prompts (never written to the session file)
pub const GENERATION_CUE: &str = "Assistant: ";

/// Marker that opens every in-band error reply
pub const ERROR_MARKER: &str = "[Error:";

/// Error replies quote at most this many characters of the failure message
pub const MAX_ERROR_CHARS: usize = 200;

/// Reply injected for generations interrupted by a daemon restart
pub const RESTART_ERROR: &str = "[Error: Daemon restarted during generation]";

fn is_user_line(line: &str) -> bool {
    line.starts_with(USER_PREFIX.trim_end())
}

fn is_assistant_line(line: &str) -> bool {
    line.starts_with(ASSISTANT_PREFIX.trim_end())
}

/// Returns true if the last `User:` line has no `Assistant:` line after it.
///
/// Only non-blank lines are indexed; unprefixed context lines never count.
pub fn needs_response(content: &str) -> bool {
    let mut last_user: Option<usize> = None;
    let mut last_assistant: Option<usize> = None;

    for (idx, line) in content.lines().filter(|l| !l.trim().is_empty()).enumerate() {
        if is_user_line(line) {
            last_user = Some(idx);
        } else if is_assistant_line(line) {
            last_assistant = Some(idx);
        }
    }

    match (last_user, last_assistant) {
        (Some(user), Some(assistant)) => user > assistant,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Build the backend prompt: history without trailing newlines, then the cue
pub fn build_prompt(content: &str) -> String {
    let history = content.trim_end_matches(['\n', '\r']);
    let mut prompt = String::with_capacity(history.len() + GENERATION_CUE.len() + 1);
    prompt.push_str(history);
    prompt.push('\n');
    prompt.push_str(GENERATION_CUE);
    prompt
}

/// Drop the oldest line pairs until the content fits in `max_chars`.
///
/// Line terminators are preserved. The most recent two lines always survive,
/// even when they alone exceed the budget.
pub fn trim_to_context(content: &str, max_chars: usize) -> String {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let mut total: usize = lines.iter().map(|l| l.chars().count()).sum();
    let mut start = 0;

    while total > max_chars && lines.len() - start >= 4 {
        total -= lines[start..start + 2]
            .iter()
            .map(|l| l.chars().count())
            .sum::<usize>();
        start += 2;
    }

    lines[start..].concat()
}

/// Collapse text onto one line: control characters (newlines included) become spaces
pub fn single_line(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Format the in-band reply recorded when generation fails
pub fn error_reply(message: &str) -> String {
    let truncated: String = single_line(message).chars().take(MAX_ERROR_CHARS).collect();
    format!("{} {}]", ERROR_MARKER, truncated)
}

/// Format a complete assistant line, newline included.
///
/// A reply spanning several lines would smuggle extra turns into the file,
/// so it is flattened first.
pub fn assistant_line(reply: &str) -> String {
    format!("{}{}\n", ASSISTANT_PREFIX, single_line(reply))
}

/// Format a complete user line, newline included
pub fn user_line(message: &str) -> String {
    format!("{}{}\n", USER_PREFIX, message)
}

/// Client-side view of a session file, derived on every read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub session_id: String,
    pub raw_content: String,
}

impl Response {
    pub fn new(session_id: impl Into<String>, raw_content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            raw_content: raw_content.into(),
        }
    }

    /// All non-blank lines of the conversation
    pub fn history(&self) -> Vec<&str> {
        self.raw_content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect()
    }

    /// Text of the last `Assistant: ` line, or "" if there is none
    pub fn content(&self) -> &str {
        self.raw_content
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix(ASSISTANT_PREFIX))
            .unwrap_or("")
    }

    /// Whether the last reply is an in-band daemon error
    pub fn is_error(&self) -> bool {
        self.content().starts_with(ERROR_MARKER)
    }
}
