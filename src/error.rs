//! Error types for the watcher.
//!
//! Construction failures are fatal and come back from [`crate::Watcher::new`].
//! Everything else is recoverable and travels on the watcher's error channel.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors raised while building a watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("could not determine home directory")]
    HomeDirNotFound,
    #[error("no session files found in {}", root.display())]
    NoSessions { root: PathBuf },
    #[error("session {id} not found")]
    SessionNotFound { id: String },
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A single log line that could not be turned into events.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse {kind} message: {source}")]
    Message {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Recoverable errors reported on the error channel while tailing.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("{}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },
    #[error("scanner error reading {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line longer than {limit} bytes in {}", path.display())]
    LineTooLong { path: PathBuf, limit: usize },
}

impl WatchError {
    /// The file the error was observed in.
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::Parse { path, .. } | Self::Scan { path, .. } | Self::LineTooLong { path, .. } => {
                path
            }
        }
    }
}
