//! Background task correlation.
//!
//! Every file in `<session-id>/tool-results/` is the output of one tool call, named
//! by its tool-use id. The session logs are searched for the `tool_use` block that
//! started it (for a label and the owning agent) and for a matching `tool_result`
//! block (for completion).

use crate::paths;
use crate::session::{BackgroundTask, Session};
use serde_json::Value;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const FALLBACK_LABEL: &str = "Background Task";
const LABEL_DETAIL_MAX: usize = 30;

/// Where a tool call came from and how to show it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOrigin {
    /// Empty for the main session
    pub agent_id: String,
    pub label: String,
}

fn content_blocks(record: &Value) -> impl Iterator<Item = &Value> {
    record
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn block_type(block: &Value) -> Option<&str> {
    block.get("type").and_then(Value::as_str)
}

/// Visit each line of `path` that mentions `needle`, parsed as JSON.
fn for_each_record(
    path: &Path,
    needles: &[&str],
    mut visit: impl FnMut(&Value) -> bool,
) -> io::Result<()> {
    let reader = BufReader::new(File::open(path)?);
    for line in reader.split(b'\n') {
        let line = line?;
        let Ok(text) = std::str::from_utf8(&line) else {
            continue;
        };
        if !needles.iter().any(|n| text.contains(n)) {
            continue;
        }
        let Ok(record) = serde_json::from_str::<Value>(text) else {
            continue;
        };
        if visit(&record) {
            break;
        }
    }
    Ok(())
}

fn find_tool_use(path: &Path, tool_id: &str) -> io::Result<Option<(String, Value)>> {
    let mut found = None;
    for_each_record(path, &[tool_id], |record| {
        found = content_blocks(record)
            .find(|b| {
                block_type(b) == Some("tool_use")
                    && b.get("id").and_then(Value::as_str) == Some(tool_id)
            })
            .map(|b| {
                let name = b.get("name").and_then(Value::as_str).unwrap_or("");
                let input = b.get("input").cloned().unwrap_or(Value::Null);
                (name.to_string(), input)
            });
        found.is_some()
    })?;
    Ok(found)
}

/// Search the session logs, main first, for the call that produced `tool_id`.
pub fn find_tool_origin(files: &[(PathBuf, Option<String>)], tool_id: &str) -> Option<ToolOrigin> {
    for (path, agent_id) in files {
        match find_tool_use(path, tool_id) {
            Ok(Some((name, input))) => {
                return Some(ToolOrigin {
                    agent_id: agent_id.clone().unwrap_or_default(),
                    label: format_task_label(&name, &input),
                });
            }
            Ok(None) => {}
            Err(e) => debug!(path = %path.display(), error = %e, "failed to search log for tool use"),
        }
    }
    None
}

fn truncate_detail(s: &str) -> String {
    let cut = crate::truncate(s, LABEL_DETAIL_MAX);
    if cut.len() < s.len() {
        format!("{cut}...")
    } else {
        s.to_string()
    }
}

/// `Bash: <command>` / `Task: <description>`, else the bare tool name.
pub fn format_task_label(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(Value::as_str).unwrap_or("");
    let detail = match name {
        "Bash" => field("command"),
        "Task" => field("description"),
        _ => "",
    };
    if detail.is_empty() {
        if name.is_empty() {
            return FALLBACK_LABEL.to_string();
        }
        return name.to_string();
    }
    format!("{name}: {}", truncate_detail(detail))
}

/// Which of `tool_ids` have a `tool_result` block in any of `files`.
pub fn completed_tools(files: &[(PathBuf, Option<String>)], tool_ids: &[String]) -> HashSet<String> {
    let mut done = HashSet::new();
    if tool_ids.is_empty() {
        return done;
    }
    let needles: Vec<&str> = tool_ids.iter().map(String::as_str).collect();

    for (path, _) in files {
        let result = for_each_record(path, &needles, |record| {
            for block in content_blocks(record) {
                if block_type(block) != Some("tool_result") {
                    continue;
                }
                if let Some(id) = block.get("tool_use_id").and_then(Value::as_str)
                    && tool_ids.iter().any(|t| t == id)
                {
                    done.insert(id.to_string());
                }
            }
            done.len() == tool_ids.len()
        });
        if let Err(e) = result {
            debug!(path = %path.display(), error = %e, "failed to search log for tool result");
        }
        if done.len() == tool_ids.len() {
            break;
        }
    }
    done
}

/// Register tool-results artifacts the session doesn't know about yet.
///
/// Returns the tasks this call added.
pub fn discover_tasks(session: &Session) -> Vec<BackgroundTask> {
    let dir = paths::tool_results_dir(session.main_path());
    let entries = match std::fs::read_dir(&dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    let mut artifacts: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    artifacts.sort();

    let mut added = Vec::new();
    let mut files = None;
    for output_path in artifacts {
        let tool_id = output_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();
        if tool_id.is_empty() || session.has_background_task(&tool_id) {
            continue;
        }

        let files: &[_] = files.get_or_insert_with(|| session.files());
        let origin = find_tool_origin(files, &tool_id).unwrap_or_else(|| ToolOrigin {
            agent_id: String::new(),
            label: FALLBACK_LABEL.to_string(),
        });
        let is_complete = completed_tools(files, std::slice::from_ref(&tool_id)).contains(&tool_id);

        let task = BackgroundTask {
            tool_id,
            parent_agent_id: origin.agent_id,
            label: origin.label,
            output_path,
            is_complete,
        };
        if session.add_background_task(task.clone()) {
            info!(session_id = %session.id(), tool_id = %task.tool_id, label = %task.label, "background task");
            added.push(task);
        }
    }
    added
}

/// Re-check incomplete tasks; returns the ids that completed on this pass.
pub fn refresh_completion(session: &Session) -> Vec<String> {
    let pending = session.incomplete_task_ids();
    if pending.is_empty() {
        return Vec::new();
    }

    let done = completed_tools(&session.files(), &pending);
    let mut completed: Vec<String> = done
        .into_iter()
        .filter(|id| session.complete_task(id))
        .collect();
    completed.sort();
    for id in &completed {
        debug!(session_id = %session.id(), tool_id = %id, "background task complete");
    }
    completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn append_json(path: &Path, v: Value) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        writeln!(f, "{}", serde_json::to_string(&v).unwrap()).unwrap();
    }

    fn tool_use(id: &str, name: &str, input: Value) -> Value {
        json!({
            "type": "assistant",
            "message": { "content": [{ "type": "tool_use", "id": id, "name": name, "input": input }] }
        })
    }

    fn tool_result(id: &str) -> Value {
        json!({
            "type": "user",
            "message": { "content": [{ "type": "tool_result", "tool_use_id": id, "content": "done" }] }
        })
    }

    struct Fixture {
        _tmp: TempDir,
        session: Session,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("-proj");
        let main = project.join("sess1.jsonl");
        std::fs::create_dir_all(project.join("sess1/tool-results")).unwrap();
        std::fs::create_dir_all(project.join("sess1/subagents")).unwrap();
        std::fs::write(&main, "").unwrap();
        let session = Session::new("sess1".into(), "proj".into(), main);
        Fixture { _tmp: tmp, session }
    }

    fn artifact(session: &Session, tool_id: &str) {
        let dir = paths::tool_results_dir(session.main_path());
        std::fs::write(dir.join(format!("{tool_id}.txt")), "output").unwrap();
    }

    #[test]
    fn labels() {
        assert_eq!(
            format_task_label("Bash", &json!({ "command": "npm run dev" })),
            "Bash: npm run dev"
        );
        assert_eq!(
            format_task_label(
                "Bash",
                &json!({ "command": "this is a very long command that goes on" })
            ),
            "Bash: this is a very long command th..."
        );
        assert_eq!(
            format_task_label("Task", &json!({ "description": "Explore codebase" })),
            "Task: Explore codebase"
        );
        assert_eq!(format_task_label("Bash", &json!({})), "Bash");
        assert_eq!(format_task_label("Other", &json!({ "command": "x" })), "Other");
        assert_eq!(format_task_label("", &Value::Null), FALLBACK_LABEL);
    }

    #[test]
    fn task_found_in_main_log() {
        let f = fixture();
        append_json(
            f.session.main_path(),
            tool_use("toolu_01ABC", "Bash", json!({ "command": "cargo build" })),
        );
        artifact(&f.session, "toolu_01ABC");

        let added = discover_tasks(&f.session);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].tool_id, "toolu_01ABC");
        assert_eq!(added[0].label, "Bash: cargo build");
        assert!(added[0].parent_agent_id.is_empty());
        assert!(!added[0].is_complete);

        assert!(discover_tasks(&f.session).is_empty());
    }

    #[test]
    fn task_found_in_subagent_log() {
        let f = fixture();
        let sub = paths::subagents_dir(f.session.main_path()).join("agent-abc1234.jsonl");
        append_json(&sub, tool_use("toolu_sub", "Task", json!({ "description": "dig" })));
        f.session.add_subagent("abc1234".into(), sub);
        artifact(&f.session, "toolu_sub");

        let added = discover_tasks(&f.session);
        assert_eq!(added[0].parent_agent_id, "abc1234");
        assert_eq!(added[0].label, "Task: dig");
    }

    #[test]
    fn unknown_origin_falls_back() {
        let f = fixture();
        artifact(&f.session, "toolu_orphan");
        let added = discover_tasks(&f.session);
        assert_eq!(added[0].label, FALLBACK_LABEL);
        assert!(added[0].parent_agent_id.is_empty());
    }

    #[test]
    fn mention_without_tool_use_shape_does_not_match() {
        let f = fixture();
        append_json(
            f.session.main_path(),
            json!({
                "type": "assistant",
                "message": { "content": [{ "type": "text", "text": "started toolu_X in background" }] }
            }),
        );
        assert!(find_tool_origin(&f.session.files(), "toolu_X").is_none());
        assert!(completed_tools(&f.session.files(), &["toolu_X".to_string()]).is_empty());
    }

    #[test]
    fn completion_flips_once() {
        let f = fixture();
        append_json(
            f.session.main_path(),
            tool_use("toolu_01", "Bash", json!({ "command": "sleep 5" })),
        );
        artifact(&f.session, "toolu_01");
        discover_tasks(&f.session);
        assert!(refresh_completion(&f.session).is_empty());

        append_json(f.session.main_path(), tool_result("toolu_01"));
        assert_eq!(refresh_completion(&f.session), vec!["toolu_01".to_string()]);
        assert!(f.session.background_tasks()[0].is_complete);

        append_json(f.session.main_path(), tool_result("toolu_01"));
        assert!(refresh_completion(&f.session).is_empty());
        assert!(f.session.background_tasks()[0].is_complete);
    }

    #[test]
    fn already_finished_task_starts_complete() {
        let f = fixture();
        append_json(
            f.session.main_path(),
            tool_use("toolu_02", "Bash", json!({ "command": "ls" })),
        );
        append_json(f.session.main_path(), tool_result("toolu_02"));
        artifact(&f.session, "toolu_02");

        let added = discover_tasks(&f.session);
        assert!(added[0].is_complete);
    }
}
