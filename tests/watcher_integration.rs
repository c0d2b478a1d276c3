use claude_esp::{
    StreamEvent, StreamKind, WatchMode, Watcher, WatcherError, WatcherOptions, WatcherStreams,
    config::WatcherConfig, list_active_sessions, list_sessions,
};
use serde_json::{Value, json};
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::time::timeout;

const DEADLINE: Duration = Duration::from_secs(3);

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> &'static Mutex<()> {
    ENV_LOCK.get_or_init(|| Mutex::new(()))
}

struct EnvVarGuard {
    key: &'static str,
    original: Option<OsString>,
}

impl EnvVarGuard {
    fn set(key: &'static str, value: &Path) -> Self {
        let original = std::env::var_os(key);

        // Environment mutation is serialized by `env_lock`.
        unsafe {
            std::env::set_var(key, value);
        }

        Self { key, original }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.original {
            Some(value) => unsafe {
                std::env::set_var(self.key, value);
            },
            None => unsafe {
                std::env::remove_var(self.key);
            },
        }
    }
}

fn write_jsonl(path: &Path, lines: &[Value]) {
    let mut out = String::new();
    for line in lines {
        out.push_str(&serde_json::to_string(line).unwrap());
        out.push('\n');
    }
    std::fs::write(path, out).unwrap();
}

fn append_jsonl(path: &Path, line: &Value) {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    writeln!(f, "{}", serde_json::to_string(line).unwrap()).unwrap();
}

fn assistant(blocks: Value) -> Value {
    json!({
        "type": "assistant",
        "timestamp": "2026-01-31T12:45:31.123Z",
        "message": { "role": "assistant", "content": blocks }
    })
}

fn user(blocks: Value) -> Value {
    json!({
        "type": "user",
        "timestamp": "2026-01-31T12:45:32Z",
        "message": { "role": "user", "content": blocks }
    })
}

/// `<root>/-Users-me-work-app/<id>.jsonl`
fn create_session(root: &Path, id: &str, lines: &[Value]) -> PathBuf {
    let project = root.join("-Users-me-work-app");
    std::fs::create_dir_all(&project).unwrap();
    let path = project.join(format!("{id}.jsonl"));
    write_jsonl(&path, lines);
    path
}

fn options(root: &Path, session_id: Option<&str>, force_poll: bool) -> WatcherOptions {
    WatcherOptions {
        session_id: session_id.map(str::to_string),
        root: Some(root.to_path_buf()),
        config: WatcherConfig {
            poll_interval_ms: 50,
            debounce_ms: 20,
            force_poll,
            ..WatcherConfig::default()
        },
    }
}

async fn recv_until(
    streams: &mut WatcherStreams,
    deadline: Duration,
    mut pred: impl FnMut(&StreamEvent) -> bool,
) -> Vec<StreamEvent> {
    let mut out = Vec::new();
    let start = tokio::time::Instant::now();
    loop {
        let Some(remaining) = deadline.checked_sub(start.elapsed()) else {
            return out;
        };
        match timeout(remaining, streams.events.recv()).await {
            Ok(Some(ev)) => {
                let done = pred(&ev);
                out.push(ev);
                if done {
                    return out;
                }
            }
            _ => return out,
        }
    }
}

async fn full_session_flow(force_poll: bool) {
    let tmp = TempDir::new().unwrap();
    let main = create_session(
        tmp.path(),
        "5f1c2e7a-0b7e-4c1e-9a55-1d2f3e4a5b6c",
        &[user(json!([{ "type": "text", "text": "run the tests" }]))],
    );

    let (w, mut streams) =
        Watcher::with_options(options(tmp.path(), Some("5f1c2e7a"), force_poll)).unwrap();
    if force_poll {
        assert_eq!(w.mode(), WatchMode::Poll);
    }
    w.start();

    append_jsonl(
        &main,
        &assistant(json!([
            { "type": "thinking", "thinking": "Let me check the suite." },
            { "type": "tool_use", "id": "toolu_01", "name": "Bash",
              "input": { "command": "cargo test", "description": "Run tests" } }
        ])),
    );
    append_jsonl(
        &main,
        &user(json!([
            { "type": "tool_result", "tool_use_id": "toolu_01", "content": "1 failed", "is_error": true }
        ])),
    );

    let got = recv_until(&mut streams, DEADLINE, |ev| ev.kind == StreamKind::ToolOutput).await;
    let kinds: Vec<_> = got.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![StreamKind::Thinking, StreamKind::ToolInput, StreamKind::ToolOutput]
    );
    assert_eq!(got[0].content, "Let me check the suite.");
    assert_eq!(got[1].tool_name, "Bash");
    assert_eq!(got[1].tool_id, "toolu_01");
    assert_eq!(got[1].content, "cargo test\n  # Run tests");
    assert_eq!(got[2].tool_id, "toolu_01");
    assert!(got[2].is_error);
    for ev in &got {
        assert_eq!(ev.session_id, "5f1c2e7a-0b7e-4c1e-9a55-1d2f3e4a5b6c");
        assert_eq!(ev.agent_name, "Main");
        assert!(ev.agent_id.is_empty());
    }

    // Subagent log
    let sub_dir = main.with_extension("").join("subagents");
    std::fs::create_dir_all(&sub_dir).unwrap();
    append_jsonl(
        &sub_dir.join("agent-a1b2c3d4e5.jsonl"),
        &assistant(json!([{ "type": "text", "text": "subagent reporting" }])),
    );
    let agent = timeout(DEADLINE, streams.new_agents.recv())
        .await
        .expect("new agent within deadline")
        .unwrap();
    assert_eq!(agent.agent_id, "a1b2c3d4e5");
    let got = recv_until(&mut streams, DEADLINE, |ev| ev.content == "subagent reporting").await;
    let last = got.last().expect("subagent event");
    assert_eq!(last.content, "subagent reporting");
    assert_eq!(last.agent_id, "a1b2c3d4e5");
    assert_eq!(last.agent_name, "Agent-a1b2c3d");

    w.stop();
    assert!(w.is_stopped());
}

#[tokio::test]
async fn full_session_flow_polling() {
    full_session_flow(true).await;
}

#[tokio::test]
async fn full_session_flow_notifications() {
    full_session_flow(false).await;
}

#[tokio::test]
async fn background_task_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let main = create_session(
        tmp.path(),
        "sess-bg",
        &[assistant(json!([{
            "type": "tool_use", "id": "toolu_bg", "name": "Task",
            "input": { "description": "Investigate flaky integration test", "prompt": "..." }
        }]))],
    );
    let results = main.with_extension("").join("tool-results");
    std::fs::create_dir_all(&results).unwrap();
    std::fs::write(results.join("toolu_bg.txt"), "working").unwrap();

    let (w, mut streams) = Watcher::with_options(options(tmp.path(), Some("sess-bg"), true)).unwrap();
    w.start();

    let new = timeout(DEADLINE, streams.new_tasks.recv())
        .await
        .expect("task within deadline")
        .unwrap();
    assert_eq!(new.task.tool_id, "toolu_bg");
    assert_eq!(new.task.label, "Task: Investigate flaky integration ...");
    assert!(new.task.parent_agent_id.is_empty());
    assert!(!new.task.is_complete);

    append_jsonl(
        &main,
        &user(json!([{ "type": "tool_result", "tool_use_id": "toolu_bg", "content": "done" }])),
    );
    let start = tokio::time::Instant::now();
    while !w.background_tasks("sess-bg").iter().all(|t| t.is_complete) && start.elapsed() < DEADLINE {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let tasks = w.background_tasks("sess-bg");
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].is_complete);
    assert!(w.background_tasks("unknown").is_empty());
    w.stop();
}

#[tokio::test]
async fn empty_root_has_no_sessions() {
    let tmp = TempDir::new().unwrap();
    match Watcher::with_options(options(tmp.path(), Some("anything"), true)) {
        Err(WatcherError::NoSessions { .. }) => {}
        other => panic!("unexpected result: {other:?}"),
    }

    let (w, _streams) = Watcher::with_options(options(tmp.path(), None, true)).unwrap();
    assert!(w.sessions().is_empty());
    assert!(w.is_auto_discovery_enabled());
}

#[tokio::test]
async fn listings_use_claude_home() {
    let _lock = env_lock().lock().await;
    let tmp = TempDir::new().unwrap();
    let projects = tmp.path().join("projects");
    create_session(&projects, "older", &[]);
    std::thread::sleep(Duration::from_millis(20));
    create_session(&projects, "newer", &[]);
    let _home = EnvVarGuard::set("CLAUDE_HOME", tmp.path());

    let sessions = list_sessions(10).unwrap();
    let ids: Vec<_> = sessions.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["newer", "older"]);
    assert!(sessions.iter().all(|s| s.is_active));

    assert_eq!(list_sessions(1).unwrap().len(), 1);
    assert_eq!(list_active_sessions(Duration::from_secs(60)).unwrap().len(), 2);

    let (w, _streams) = Watcher::new(Some("old")).unwrap();
    let ids: Vec<_> = w.sessions().iter().map(|s| s.id().to_string()).collect();
    assert_eq!(ids, vec!["older"]);
    assert!(!w.is_auto_discovery_enabled());
}
