//! claude-esp — live view into Claude Code sessions
//!
//! Reads the JSONL logs Claude Code writes under `~/.claude/projects`, turns each
//! record into display events (thinking, tool calls, tool output, text) and follows
//! the logs as they grow, including subagent logs and background tasks.

pub mod config;
pub mod correlator;
pub mod discovery;
mod error;
mod event;
pub mod parser;
pub mod paths;
pub mod registry;
mod session;
pub mod tailer;
mod watcher;

pub use discovery::{list_active_sessions, list_sessions};
pub use error::*;
pub use event::*;
pub use session::*;
pub use watcher::{WatchMode, Watcher, WatcherOptions, WatcherStreams};

/// Truncate a string to at most `max` characters (by Unicode char boundary).
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
