//! Fixed-interval polling loop.

use super::{Core, WatchMode, WatchStrategy};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tracing::debug;

pub(super) struct PollStrategy;

impl WatchStrategy for PollStrategy {
    fn mode(&self) -> WatchMode {
        WatchMode::Poll
    }

    fn spawn(self: Box<Self>, core: Arc<Core>) {
        tokio::spawn(run(core));
    }
}

async fn run(core: Arc<Core>) {
    core.initial_ingest().await;

    let mut tick = interval(core.config.poll_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let cleanup_every = core.config.cleanup_interval();
    let mut cleanup = interval_at(Instant::now() + cleanup_every, cleanup_every);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = core.shutdown.cancelled() => break,
            _ = cleanup.tick() => {
                core.tailer.prune_missing();
            }
            _ = tick.tick() => core.reconcile().await,
        }
    }
    debug!("poll loop stopped");
}

#[cfg(test)]
mod tests {
    use super::super::tests::{append_jsonl, options, recv_content, session_file, text};
    use super::super::Watcher;
    use crate::paths;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn polling_delivers_appended_lines() {
        let tmp = TempDir::new().unwrap();
        let main = session_file(tmp.path(), "sess001");
        let (w, mut streams) =
            Watcher::with_options(options(tmp.path(), Some("sess001"), true)).unwrap();
        w.start();

        let first = recv_content(&mut streams.events, Duration::from_secs(2), "hello").await;
        assert!(first.is_some(), "history line delivered");

        append_jsonl(&main, &text("polled"));
        let ev = recv_content(&mut streams.events, Duration::from_secs(2), "polled")
            .await
            .expect("appended line delivered");
        assert_eq!(ev.session_id, "sess001");
        assert_eq!(ev.agent_name, "Main");
        w.stop();
    }

    #[tokio::test]
    async fn polling_finds_new_sessions_and_subagents() {
        let tmp = TempDir::new().unwrap();
        let main = session_file(tmp.path(), "sess001");
        let (w, mut streams) = Watcher::with_options(options(tmp.path(), None, true)).unwrap();
        w.start();

        session_file(tmp.path(), "sess002");
        let new = timeout(Duration::from_secs(2), streams.new_sessions.recv())
            .await
            .expect("new session within deadline")
            .unwrap();
        assert_eq!(new.session_id, "sess002");
        assert_eq!(new.project_path, "home/me/proj");

        let sub_dir = paths::subagents_dir(&main);
        std::fs::create_dir_all(&sub_dir).unwrap();
        append_jsonl(&sub_dir.join("agent-abc1234.jsonl"), &text("from sub"));

        let agent = timeout(Duration::from_secs(2), streams.new_agents.recv())
            .await
            .expect("new agent within deadline")
            .unwrap();
        assert_eq!(agent.session_id, "sess001");
        assert_eq!(agent.agent_id, "abc1234");

        let ev = recv_content(&mut streams.events, Duration::from_secs(2), "from sub")
            .await
            .expect("subagent line delivered");
        assert_eq!(ev.agent_name, "Agent-abc1234");
        w.stop();
    }

    #[tokio::test]
    async fn removed_session_is_no_longer_tailed() {
        let tmp = TempDir::new().unwrap();
        let main = session_file(tmp.path(), "sess001");
        let (w, mut streams) =
            Watcher::with_options(options(tmp.path(), Some("sess001"), true)).unwrap();
        w.start();
        recv_content(&mut streams.events, Duration::from_secs(2), "hello").await;

        assert!(w.remove_session("sess001"));
        append_jsonl(&main, &text("ignored"));
        let ev = recv_content(&mut streams.events, Duration::from_millis(300), "ignored").await;
        assert!(ev.is_none());
        w.stop();
    }
}
