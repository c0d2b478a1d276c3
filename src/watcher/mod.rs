//! Session watcher.
//!
//! A [`Watcher`] owns the monitored sessions, the per-file read offsets and the
//! output channels. The work itself runs in one of two strategies picked when the
//! watcher is built:
//!
//! - **push**: filesystem notifications with per-file debounce ([`push`])
//! - **poll**: a fixed-interval scan of everything ([`poll`]), used when
//!   notifications are unavailable or disabled
//!
//! Both feed the same channels, handed out once as [`WatcherStreams`].

mod poll;
mod push;

use crate::config::{self, WatcherConfig};
use crate::correlator;
use crate::discovery;
use crate::error::{WatchError, WatcherError};
use crate::event::{NewAgent, NewBackgroundTask, NewSession, StreamEvent};
use crate::paths;
use crate::registry::SessionRegistry;
use crate::session::{ActivityInfo, BackgroundTask, Session};
use crate::tailer::{self, Tailer};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How the watcher learns about changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Push,
    Poll,
}

impl std::fmt::Display for WatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => f.write_str("push"),
            Self::Poll => f.write_str("poll"),
        }
    }
}

/// A watch loop implementation.
trait WatchStrategy: Send {
    fn mode(&self) -> WatchMode;

    /// Run the loop on its own task until the core's shutdown token fires.
    fn spawn(self: Box<Self>, core: Arc<Core>);
}

/// Receiving ends of the watcher's output channels.
///
/// None of them must be drained; a full channel drops what doesn't fit, except
/// `events`, which waits for room (or shutdown).
#[derive(Debug)]
pub struct WatcherStreams {
    pub events: mpsc::Receiver<StreamEvent>,
    pub errors: mpsc::Receiver<WatchError>,
    pub new_sessions: mpsc::Receiver<NewSession>,
    pub new_agents: mpsc::Receiver<NewAgent>,
    pub new_tasks: mpsc::Receiver<NewBackgroundTask>,
}

#[derive(Debug)]
struct Outputs {
    events: mpsc::Sender<StreamEvent>,
    errors: mpsc::Sender<WatchError>,
    new_sessions: mpsc::Sender<NewSession>,
    new_agents: mpsc::Sender<NewAgent>,
    new_tasks: mpsc::Sender<NewBackgroundTask>,
}

fn offer<T>(tx: &mpsc::Sender<T>, msg: T, what: &'static str) {
    if tx.try_send(msg).is_err() {
        trace!(channel = what, "channel full or closed; dropping");
    }
}

impl Outputs {
    fn new(config: &WatcherConfig) -> (Self, WatcherStreams) {
        let event_cap = config.event_buffer.max(1);
        let notify_cap = config.notify_buffer.max(1);
        let (events_tx, events) = mpsc::channel(event_cap);
        let (errors_tx, errors) = mpsc::channel(notify_cap);
        let (sessions_tx, new_sessions) = mpsc::channel(notify_cap);
        let (agents_tx, new_agents) = mpsc::channel(notify_cap);
        let (tasks_tx, new_tasks) = mpsc::channel(notify_cap);
        (
            Self {
                events: events_tx,
                errors: errors_tx,
                new_sessions: sessions_tx,
                new_agents: agents_tx,
                new_tasks: tasks_tx,
            },
            WatcherStreams {
                events,
                errors,
                new_sessions,
                new_agents,
                new_tasks,
            },
        )
    }
}

/// State shared by the public handle, the watch loop and debounce tasks.
#[derive(Debug)]
struct Core {
    root: PathBuf,
    config: WatcherConfig,
    registry: SessionRegistry,
    tailer: Tailer,
    auto_discovery: AtomicBool,
    skip_history: AtomicBool,
    outputs: Outputs,
    shutdown: CancellationToken,
    /// Tail passes that read at least one event.
    #[cfg(test)]
    tail_passes: std::sync::atomic::AtomicUsize,
}

impl Core {
    fn report(&self, err: WatchError) {
        debug!(error = %err, "recoverable watch error");
        offer(&self.outputs.errors, err, "errors");
    }

    /// Hand an event to the consumer. Returns `false` if shutdown won the race.
    async fn deliver(&self, event: StreamEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            // A dropped receiver counts as delivered so offsets keep moving.
            _ = self.outputs.events.send(event) => true,
        }
    }

    /// Read and deliver whatever was appended to one file.
    async fn tail_file(&self, path: &Path, session_id: &str, agent_id: Option<&str>) {
        let gate = self.tailer.gate(path);
        let _guard = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            guard = gate.lock() => guard,
        };

        let Some(batch) = self.tailer.read_new(path, session_id, agent_id) else {
            return;
        };
        #[cfg(test)]
        if !batch.events.is_empty() {
            self.tail_passes.fetch_add(1, Ordering::Relaxed);
        }
        for err in batch.errors {
            self.report(err);
        }
        for event in batch.events {
            if !self.deliver(event).await {
                return;
            }
        }
        self.tailer.commit(path, batch.end);
    }

    async fn tail_session(&self, session: &Session) {
        for (path, agent_id) in session.files() {
            if self.shutdown.is_cancelled() {
                return;
            }
            self.tail_file(&path, session.id(), agent_id.as_deref()).await;
        }
    }

    /// Start monitoring the session logged at `main_path` unless it is already known.
    fn adopt_session(&self, main_path: &Path) -> Option<Arc<Session>> {
        if self
            .registry
            .contains(&paths::session_id_from_path(main_path))
        {
            return None;
        }
        let session = self.registry.insert_if_absent(discovery::build_session(main_path))?;
        offer(
            &self.outputs.new_sessions,
            NewSession {
                session_id: session.id().to_string(),
                project_path: session.project_path().to_string(),
                path: session.main_path().to_path_buf(),
            },
            "new_sessions",
        );
        Some(session)
    }

    /// Adopt recently active sessions that aren't monitored yet.
    fn check_new_sessions(&self) -> Vec<Arc<Session>> {
        let window = self.config.active_window();
        let now = SystemTime::now();
        discovery::main_session_files(&self.root)
            .into_iter()
            .filter(|(_, modified)| now.duration_since(*modified).unwrap_or(Duration::ZERO) <= window)
            .filter_map(|(path, _)| self.adopt_session(&path))
            .collect()
    }

    /// Register subagent logs that appeared since the last check.
    fn check_new_subagents(&self, session: &Session) -> Vec<(String, PathBuf)> {
        let mut added = Vec::new();
        for (agent_id, path) in discovery::scan_subagents(session.main_path()) {
            if session.has_subagent(&agent_id) {
                continue;
            }
            if session.add_subagent(agent_id.clone(), path.clone()) {
                info!(session_id = %session.id(), %agent_id, "new subagent");
                offer(
                    &self.outputs.new_agents,
                    NewAgent {
                        session_id: session.id().to_string(),
                        agent_id: agent_id.clone(),
                    },
                    "new_agents",
                );
                added.push((agent_id, path));
            }
        }
        added
    }

    /// Pick up new tool-results artifacts and re-check unfinished tasks.
    fn check_background_tasks(&self, session: &Session) {
        for task in correlator::discover_tasks(session) {
            offer(
                &self.outputs.new_tasks,
                NewBackgroundTask {
                    session_id: session.id().to_string(),
                    task,
                },
                "new_tasks",
            );
        }
        correlator::refresh_completion(session);
    }

    /// First read of the monitored sessions, honoring the history-skip policy.
    async fn initial_ingest(&self) {
        let sessions = self.registry.snapshot();
        let files: Vec<PathBuf> = sessions
            .iter()
            .flat_map(|s| s.files())
            .map(|(path, _)| path)
            .collect();

        let requested = self.skip_history.load(Ordering::Relaxed);
        let skip = requested || {
            let total: u64 = files
                .iter()
                .filter_map(|p| tailer::count_lines(p).ok())
                .sum();
            debug!(total, threshold = self.config.history_line_threshold, "existing log lines");
            total > self.config.history_line_threshold as u64
        };
        if skip {
            info!(keep = self.config.keep_recent_lines, requested, "skipping history");
            self.tailer
                .skip_to_recent(&files, self.config.keep_recent_lines);
        }

        for session in sessions {
            if self.shutdown.is_cancelled() {
                return;
            }
            self.check_background_tasks(&session);
            self.tail_session(&session).await;
        }
    }

    /// One full pass: discovery, subagents, background tasks, tail everything.
    async fn reconcile(&self) {
        if self.auto_discovery.load(Ordering::Relaxed) {
            self.check_new_sessions();
        }
        for session in self.registry.snapshot() {
            if self.shutdown.is_cancelled() {
                return;
            }
            self.check_new_subagents(&session);
            self.check_background_tasks(&session);
            self.tail_session(&session).await;
        }
    }
}

/// Options for [`Watcher::with_options`].
#[derive(Debug, Clone, Default)]
pub struct WatcherOptions {
    /// Watch only this session (matched as a substring of the id, newest first).
    pub session_id: Option<String>,
    /// Projects root; defaults to `$CLAUDE_HOME/projects` or `~/.claude/projects`.
    pub root: Option<PathBuf>,
    pub config: WatcherConfig,
}

/// Handle to a running (or not yet started) watch loop.
pub struct Watcher {
    core: Arc<Core>,
    mode: WatchMode,
    strategy: Mutex<Option<Box<dyn WatchStrategy>>>,
    push_state: Option<Arc<push::PushState>>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("root", &self.core.root)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Watch one session, or every recently active session when `session_id` is `None`.
    ///
    /// Uses the default projects root and the user's `config.json`.
    pub fn new(session_id: Option<&str>) -> Result<(Self, WatcherStreams), WatcherError> {
        Self::with_options(WatcherOptions {
            session_id: session_id.map(str::to_string),
            root: None,
            config: config::load(),
        })
    }

    pub fn with_options(options: WatcherOptions) -> Result<(Self, WatcherStreams), WatcherError> {
        let root = match options.root {
            Some(root) => root,
            None => paths::projects_dir()?,
        };
        // Notification backends report canonical paths.
        let root = std::fs::canonicalize(&root).unwrap_or(root);

        let config = options.config;
        let registry = SessionRegistry::new();
        let watch_active = match options.session_id.as_deref() {
            Some(id) => {
                registry.insert_if_absent(discovery::find_session(&root, id)?);
                false
            }
            None => {
                for session in discovery::discover_active(&root, config.active_window()) {
                    registry.insert_if_absent(session);
                }
                true
            }
        };

        let (outputs, streams) = Outputs::new(&config);
        let core = Arc::new(Core {
            tailer: Tailer::new(config.max_line_bytes),
            root,
            config,
            registry,
            auto_discovery: AtomicBool::new(watch_active),
            skip_history: AtomicBool::new(false),
            outputs,
            shutdown: CancellationToken::new(),
            #[cfg(test)]
            tail_passes: Default::default(),
        });

        let (strategy, push_state): (Box<dyn WatchStrategy>, _) = if core.config.force_poll {
            (Box::new(poll::PollStrategy), None)
        } else {
            match push::PushStrategy::new() {
                Ok(push) => {
                    let state = push.state();
                    (Box::new(push), Some(state))
                }
                Err(e) => {
                    warn!(error = %e, "filesystem notifications unavailable; polling instead");
                    (Box::new(poll::PollStrategy), None)
                }
            }
        };
        let mode = strategy.mode();
        info!(
            root = %core.root.display(),
            %mode,
            sessions = core.registry.len(),
            "watcher ready"
        );

        Ok((
            Self {
                core,
                mode,
                strategy: Mutex::new(Some(strategy)),
                push_state,
            },
            streams,
        ))
    }

    pub fn mode(&self) -> WatchMode {
        self.mode
    }

    pub fn root(&self) -> &Path {
        &self.core.root
    }

    /// Spawn the watch loop on the current tokio runtime. Later calls do nothing.
    pub fn start(&self) {
        let strategy = self
            .strategy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(strategy) = strategy else {
            return;
        };
        if self.core.shutdown.is_cancelled() {
            return;
        }
        strategy.spawn(Arc::clone(&self.core));
    }

    /// Signal the watch loop to finish. Never blocks; repeated calls are harmless.
    pub fn stop(&self) {
        if !self.core.shutdown.is_cancelled() {
            debug!("stopping watcher");
        }
        self.core.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.core.shutdown.is_cancelled()
    }

    /// Start each file near its end instead of replaying it. Only honored before `start`.
    pub fn set_skip_history(&self, skip: bool) {
        self.core.skip_history.store(skip, Ordering::Relaxed);
    }

    /// Stop monitoring a session. Its files are left alone.
    pub fn remove_session(&self, session_id: &str) -> bool {
        self.core.registry.remove(session_id).is_some()
    }

    /// Flip auto-discovery and return the new setting.
    pub fn toggle_auto_discovery(&self) -> bool {
        !self.core.auto_discovery.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn is_auto_discovery_enabled(&self) -> bool {
        self.core.auto_discovery.load(Ordering::Relaxed)
    }

    /// Snapshot of the monitored sessions, sorted by id.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.core.registry.snapshot()
    }

    pub fn background_tasks(&self, session_id: &str) -> Vec<BackgroundTask> {
        self.core
            .registry
            .get(session_id)
            .map(|s| s.background_tasks())
            .unwrap_or_default()
    }

    /// Per-log activity: main logs and subagent logs written within `within`.
    pub fn activity(&self, within: Duration) -> Vec<ActivityInfo> {
        let mut out = Vec::new();
        for session in self.core.registry.snapshot() {
            out.push(ActivityInfo {
                session_id: session.id().to_string(),
                agent_id: String::new(),
                is_active: paths::modified_within(session.main_path(), within),
            });
            for (agent_id, path) in session.subagents() {
                out.push(ActivityInfo {
                    session_id: session.id().to_string(),
                    agent_id,
                    is_active: paths::modified_within(&path, within),
                });
            }
        }
        out
    }

    /// Debounced reads armed but not yet started. Always 0 in poll mode.
    pub fn pending_debounce_timers(&self) -> usize {
        self.push_state.as_ref().map_or(0, |s| s.pending_timers())
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.core.shutdown.cancel();
    }
}
