//! Session entities and listing rows

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

/// A long-running tool whose output lands in `tool-results/<tool-id>.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackgroundTask {
    pub tool_id: String,
    /// Agent that started the tool; empty for the main session
    pub parent_agent_id: String,
    pub label: String,
    pub output_path: PathBuf,
    pub is_complete: bool,
}

impl BackgroundTask {
    /// Flip to complete. Returns `true` only on the first call.
    pub fn mark_complete(&mut self) -> bool {
        let changed = !self.is_complete;
        self.is_complete = true;
        changed
    }
}

#[derive(Debug, Default)]
struct Children {
    subagents: HashMap<String, PathBuf>,
    tasks: HashMap<String, BackgroundTask>,
}

/// One monitored session: its main log plus subagent logs and background tasks.
///
/// Id, project and main path never change. The child maps sit behind a lock of
/// their own so discovery can add to them while tailing reads them.
#[derive(Debug)]
pub struct Session {
    id: String,
    project_path: String,
    main_path: PathBuf,
    children: RwLock<Children>,
}

impl Session {
    pub fn new(id: String, project_path: String, main_path: PathBuf) -> Self {
        Self {
            id,
            project_path,
            main_path,
            children: RwLock::new(Children::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Children> {
        self.children.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Children> {
        self.children.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn project_path(&self) -> &str {
        &self.project_path
    }

    pub fn main_path(&self) -> &Path {
        &self.main_path
    }

    /// Subagent ids and log paths, sorted by id.
    pub fn subagents(&self) -> Vec<(String, PathBuf)> {
        let mut out: Vec<_> = self
            .read()
            .subagents
            .iter()
            .map(|(id, path)| (id.clone(), path.clone()))
            .collect();
        out.sort();
        out
    }

    pub fn has_subagent(&self, agent_id: &str) -> bool {
        self.read().subagents.contains_key(agent_id)
    }

    /// Register a subagent unless it is already known. Returns `true` if added.
    pub fn add_subagent(&self, agent_id: String, path: PathBuf) -> bool {
        let mut children = self.write();
        if children.subagents.contains_key(&agent_id) {
            return false;
        }
        children.subagents.insert(agent_id, path);
        true
    }

    /// Every log file of the session with its agent id (`None` for the main log).
    pub fn files(&self) -> Vec<(PathBuf, Option<String>)> {
        let mut out = vec![(self.main_path.clone(), None)];
        out.extend(
            self.subagents()
                .into_iter()
                .map(|(id, path)| (path, Some(id))),
        );
        out
    }

    pub fn background_tasks(&self) -> Vec<BackgroundTask> {
        let mut tasks: Vec<_> = self.read().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        tasks
    }

    pub fn has_background_task(&self, tool_id: &str) -> bool {
        self.read().tasks.contains_key(tool_id)
    }

    /// Register a background task unless it is already known. Returns `true` if added.
    pub fn add_background_task(&self, task: BackgroundTask) -> bool {
        let mut children = self.write();
        if children.tasks.contains_key(&task.tool_id) {
            return false;
        }
        children.tasks.insert(task.tool_id.clone(), task);
        true
    }

    pub(crate) fn incomplete_task_ids(&self) -> Vec<String> {
        self.read()
            .tasks
            .values()
            .filter(|t| !t.is_complete)
            .map(|t| t.tool_id.clone())
            .collect()
    }

    /// Returns `true` if this call completed the task.
    pub(crate) fn complete_task(&self, tool_id: &str) -> bool {
        self.write()
            .tasks
            .get_mut(tool_id)
            .is_some_and(BackgroundTask::mark_complete)
    }
}

/// A session log found on disk, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub path: PathBuf,
    pub project_path: String,
    pub modified: SystemTime,
    /// Modified within the recent-activity window
    pub is_active: bool,
}

/// Whether one session or subagent log has been written recently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityInfo {
    pub session_id: String,
    /// Empty for the main session log
    pub agent_id: String,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "sess1".into(),
            "home/me/proj".into(),
            PathBuf::from("/r/-home-me-proj/sess1.jsonl"),
        )
    }

    fn task(id: &str) -> BackgroundTask {
        BackgroundTask {
            tool_id: id.into(),
            parent_agent_id: String::new(),
            label: "Background Task".into(),
            output_path: PathBuf::from(format!("/r/{id}.txt")),
            is_complete: false,
        }
    }

    #[test]
    fn subagents_are_added_once() {
        let s = session();
        assert!(s.add_subagent("a1".into(), PathBuf::from("/r/a1.jsonl")));
        assert!(!s.add_subagent("a1".into(), PathBuf::from("/r/other.jsonl")));
        assert!(s.has_subagent("a1"));
        assert_eq!(s.subagents(), vec![("a1".into(), PathBuf::from("/r/a1.jsonl"))]);
    }

    #[test]
    fn files_lists_main_first() {
        let s = session();
        s.add_subagent("b".into(), PathBuf::from("/r/b.jsonl"));
        s.add_subagent("a".into(), PathBuf::from("/r/a.jsonl"));
        let files = s.files();
        assert_eq!(files[0], (s.main_path().to_path_buf(), None));
        assert_eq!(files[1].1.as_deref(), Some("a"));
        assert_eq!(files[2].1.as_deref(), Some("b"));
    }

    #[test]
    fn tasks_are_added_once() {
        let s = session();
        assert!(s.add_background_task(task("t1")));
        let mut dup = task("t1");
        dup.label = "changed".into();
        assert!(!s.add_background_task(dup));
        assert_eq!(s.background_tasks()[0].label, "Background Task");
    }

    #[test]
    fn completion_flips_exactly_once() {
        let s = session();
        s.add_background_task(task("t1"));
        assert_eq!(s.incomplete_task_ids(), vec!["t1".to_string()]);

        assert!(s.complete_task("t1"));
        assert!(!s.complete_task("t1"));
        assert!(s.background_tasks()[0].is_complete);
        assert!(s.incomplete_task_ids().is_empty());
        assert!(!s.complete_task("missing"));
    }
}
