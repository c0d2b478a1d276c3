//! Session log locations and path classification.
//!
//! Layout under the projects root:
//!
//! ```text
//! <root>/<encoded-project>/<session-id>.jsonl
//! <root>/<encoded-project>/<session-id>/subagents/agent-<agent-id>.jsonl
//! <root>/<encoded-project>/<session-id>/tool-results/<tool-id>.txt
//! ```

use crate::error::WatcherError;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const SUBAGENTS_DIR: &str = "subagents";
pub const TOOL_RESULTS_DIR: &str = "tool-results";
const AGENT_FILE_PREFIX: &str = "agent-";

/// Projects root: `$CLAUDE_HOME/projects`, else `~/.claude/projects`.
pub fn projects_dir() -> Result<PathBuf, WatcherError> {
    projects_dir_from(std::env::var_os("CLAUDE_HOME"), dirs::home_dir())
        .ok_or(WatcherError::HomeDirNotFound)
}

fn projects_dir_from(claude_home: Option<OsString>, home: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(claude_home) = claude_home.filter(|h| !h.is_empty()) {
        return Some(PathBuf::from(claude_home).join("projects"));
    }
    home.map(|h| h.join(".claude").join("projects"))
}

/// Decode a project directory name back into the real project path.
///
/// Claude Code encodes `/home/me/my-app` as `-home-me-my-app`, which is ambiguous
/// whenever a segment contains `-`. Candidates are tried from the rightmost split
/// point leftwards, keeping the tail joined with `-`, and the first one that exists
/// wins. With no match, every `-` becomes `/`. The result has no leading slash.
pub fn resolve_project_path(encoded: &str) -> String {
    let trimmed = encoded.strip_prefix('-').unwrap_or(encoded);
    if trimmed.is_empty() {
        return String::new();
    }

    let parts: Vec<&str> = trimmed.split('-').collect();
    for split in (1..parts.len()).rev() {
        let candidate = format!("/{}/{}", parts[..split].join("/"), parts[split..].join("-"));
        if Path::new(&candidate).exists() {
            return candidate[1..].to_string();
        }
    }

    trimmed.replace('-', "/")
}

pub fn is_jsonl(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"))
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

fn file_stem(path: &Path) -> &str {
    path.file_stem().and_then(|n| n.to_str()).unwrap_or("")
}

/// A top-level session log, not a subagent log.
pub fn is_main_session_file(path: &Path, is_dir: bool) -> bool {
    !is_dir
        && is_jsonl(path)
        && !path
            .components()
            .any(|c| c.as_os_str() == std::ffi::OsStr::new(SUBAGENTS_DIR))
        && !file_name(path).starts_with(AGENT_FILE_PREFIX)
}

pub fn session_id_from_path(path: &Path) -> String {
    file_stem(path).to_string()
}

/// `agent-abc1234.jsonl` -> `abc1234`
pub fn agent_id_from_path(path: &Path) -> String {
    let stem = file_stem(path);
    stem.strip_prefix(AGENT_FILE_PREFIX).unwrap_or(stem).to_string()
}

/// `<project>/<session-id>/`, the directory holding a session's side files.
pub fn session_dir(main_path: &Path) -> PathBuf {
    let id = file_stem(main_path);
    main_path
        .parent()
        .map(|p| p.join(id))
        .unwrap_or_else(|| PathBuf::from(id))
}

pub fn subagents_dir(main_path: &Path) -> PathBuf {
    session_dir(main_path).join(SUBAGENTS_DIR)
}

pub fn tool_results_dir(main_path: &Path) -> PathBuf {
    session_dir(main_path).join(TOOL_RESULTS_DIR)
}

/// Project path for a main session file, decoded from its parent directory.
pub fn project_path_for(main_path: &Path) -> String {
    let encoded = main_path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("");
    resolve_project_path(encoded)
}

pub fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok()?.modified().ok()
}

pub fn modified_within(path: &Path, window: Duration) -> bool {
    let Some(modified) = modified_at(path) else {
        return false;
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    age <= window
}

/// Every `.jsonl` file below `root`. Unreadable directories are skipped.
pub fn read_dir_recursive(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(path) = stack.pop() {
        let entries = match std::fs::read_dir(&path) {
            Ok(e) => e,
            Err(_) => continue,
        };

        for entry in entries.flatten() {
            let p = entry.path();
            match entry.file_type() {
                Ok(t) if t.is_dir() => stack.push(p),
                Ok(t) if t.is_file() && is_jsonl(&p) => out.push(p),
                _ => {}
            }
        }
    }

    out
}

/// What a path under the projects root is, judged by its position in the layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKind {
    ProjectDir,
    MainSession,
    SessionDir { session_id: String },
    SubagentsDir { session_id: String },
    Subagent { session_id: String, agent_id: String },
    ToolResultsDir { session_id: String },
    ToolResult { session_id: String, tool_id: String },
    Other,
}

pub fn classify(root: &Path, path: &Path) -> PathKind {
    let Ok(rel) = path.strip_prefix(root) else {
        return PathKind::Other;
    };
    let parts: Vec<&str> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();

    match parts.as_slice() {
        [_] if path.extension().is_none() => PathKind::ProjectDir,
        [_, file] if is_main_session_file(Path::new(file), false) => PathKind::MainSession,
        [_, dir] if Path::new(dir).extension().is_none() => PathKind::SessionDir {
            session_id: dir.to_string(),
        },
        [_, sid, SUBAGENTS_DIR] => PathKind::SubagentsDir {
            session_id: sid.to_string(),
        },
        [_, sid, TOOL_RESULTS_DIR] => PathKind::ToolResultsDir {
            session_id: sid.to_string(),
        },
        [_, sid, SUBAGENTS_DIR, file]
            if is_jsonl(Path::new(file)) && file.starts_with(AGENT_FILE_PREFIX) =>
        {
            PathKind::Subagent {
                session_id: sid.to_string(),
                agent_id: agent_id_from_path(Path::new(file)),
            }
        }
        [_, sid, TOOL_RESULTS_DIR, file] if file.ends_with(".txt") => PathKind::ToolResult {
            session_id: sid.to_string(),
            tool_id: file_stem(Path::new(file)).to_string(),
        },
        _ => PathKind::Other,
    }
}
