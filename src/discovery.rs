//! Session discovery under the projects root.
//!
//! Walks the root, keeps main session logs, and builds [`Session`] entities with
//! their subagents attached. Also hosts the listing helpers used by the CLI's
//! `--list` and `--active` modes, which need no running watcher.

use crate::config::WatcherConfig;
use crate::error::WatcherError;
use crate::paths::{self, is_jsonl};
use crate::session::{Session, SessionInfo};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Main session logs below `root`, newest first.
pub fn main_session_files(root: &Path) -> Vec<(PathBuf, SystemTime)> {
    let mut files: Vec<_> = paths::read_dir_recursive(root)
        .into_iter()
        .filter(|p| paths::is_main_session_file(p, false))
        .filter_map(|p| {
            let modified = paths::modified_at(&p)?;
            Some((p, modified))
        })
        .collect();
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    files
}

/// Subagent logs in `<session-id>/subagents/`, keyed by agent id.
pub fn scan_subagents(main_path: &Path) -> Vec<(String, PathBuf)> {
    let dir = paths::subagents_dir(main_path);
    let entries = match std::fs::read_dir(&dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    let mut out: Vec<_> = entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.path())
        .filter(|p| is_jsonl(p))
        .map(|p| (paths::agent_id_from_path(&p), p))
        .collect();
    out.sort();
    out
}

/// Build a session from its main log, attaching any subagents already on disk.
pub fn build_session(main_path: &Path) -> Session {
    let session = Session::new(
        paths::session_id_from_path(main_path),
        paths::project_path_for(main_path),
        main_path.to_path_buf(),
    );
    for (agent_id, path) in scan_subagents(main_path) {
        session.add_subagent(agent_id, path);
    }
    session
}

/// Sessions whose main log was written within `window`.
pub fn discover_active(root: &Path, window: Duration) -> Vec<Session> {
    let now = SystemTime::now();
    main_session_files(root)
        .into_iter()
        .filter(|(_, modified)| {
            now.duration_since(*modified).unwrap_or(Duration::ZERO) <= window
        })
        .map(|(path, _)| build_session(&path))
        .collect()
}

/// Every session under `root`.
pub fn discover_all(root: &Path) -> Vec<Session> {
    main_session_files(root)
        .into_iter()
        .map(|(path, _)| build_session(&path))
        .collect()
}

/// The newest session whose id contains `id`.
pub fn find_session(root: &Path, id: &str) -> Result<Session, WatcherError> {
    let files = main_session_files(root);
    if files.is_empty() {
        return Err(WatcherError::NoSessions {
            root: root.to_path_buf(),
        });
    }

    files
        .iter()
        .find(|(path, _)| paths::session_id_from_path(path).contains(id))
        .map(|(path, _)| {
            debug!(path = %path.display(), "found session");
            build_session(path)
        })
        .ok_or_else(|| WatcherError::SessionNotFound { id: id.to_string() })
}

fn session_info(path: PathBuf, modified: SystemTime, recent: Duration) -> SessionInfo {
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    SessionInfo {
        id: paths::session_id_from_path(&path),
        project_path: paths::project_path_for(&path),
        path,
        modified,
        is_active: age < recent,
    }
}

/// Up to `limit` sessions under `root`, newest first.
pub fn list_sessions_in(root: &Path, limit: usize, recent: Duration) -> Vec<SessionInfo> {
    main_session_files(root)
        .into_iter()
        .take(limit)
        .map(|(path, modified)| session_info(path, modified, recent))
        .collect()
}

/// Sessions under `root` modified within `within`, newest first.
pub fn list_active_sessions_in(root: &Path, within: Duration, recent: Duration) -> Vec<SessionInfo> {
    let now = SystemTime::now();
    main_session_files(root)
        .into_iter()
        .filter(|(_, modified)| now.duration_since(*modified).unwrap_or(Duration::ZERO) <= within)
        .map(|(path, modified)| session_info(path, modified, recent))
        .collect()
}

/// Up to `limit` most recent sessions under the default projects root.
pub fn list_sessions(limit: usize) -> Result<Vec<SessionInfo>, WatcherError> {
    let root = paths::projects_dir()?;
    let recent = WatcherConfig::default().recent_activity();
    Ok(list_sessions_in(&root, limit, recent))
}

/// Sessions under the default projects root modified within `within`.
pub fn list_active_sessions(within: Duration) -> Result<Vec<SessionInfo>, WatcherError> {
    let root = paths::projects_dir()?;
    let recent = WatcherConfig::default().recent_activity();
    Ok(list_active_sessions_in(&root, within, recent))
}
