//! Filesystem-notification loop.
//!
//! Every monitored log file is watched, along with the directories new sessions,
//! subagents and tool-results can appear in. Writes are not read right away: each
//! one (re)arms a short per-file debounce timer, so a burst of appends collapses
//! into a single tail pass once the writer goes quiet.
//!
//! If the backend reports an overflow, or events arrive faster than the loop drains
//! them, a full reconcile pass runs instead of trusting the event stream.

use super::{Core, WatchMode, WatchStrategy};
use crate::correlator;
use crate::paths::{self, PathKind};
use crate::session::Session;
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const FS_EVENT_BUFFER: usize = 1024;

/// Which session (and agent) a watched file belongs to.
#[derive(Debug, Clone)]
struct FileContext {
    session_id: String,
    agent_id: Option<String>,
}

/// An armed debounce. `cancel` only reaches the sleep; a pass that already
/// started reading runs to its commit.
struct DebounceTimer {
    seq: u64,
    cancel: CancellationToken,
}

/// Set when notifications were lost and a full pass is needed.
#[derive(Debug, Default)]
struct Overflow {
    pending: AtomicBool,
    wake: Notify,
}

impl Overflow {
    fn mark(&self) {
        self.pending.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    fn take(&self) -> bool {
        self.pending.swap(false, Ordering::Relaxed)
    }
}

pub(super) struct PushState {
    fs: Mutex<RecommendedWatcher>,
    watched: Mutex<HashSet<PathBuf>>,
    contexts: RwLock<HashMap<PathBuf, FileContext>>,
    timers: Mutex<HashMap<PathBuf, DebounceTimer>>,
    next_seq: AtomicU64,
    overflow: Arc<Overflow>,
}

pub(super) struct PushStrategy {
    state: Arc<PushState>,
    rx: mpsc::Receiver<notify::Event>,
}

impl PushStrategy {
    /// Fails when the platform notification backend can't be initialized.
    pub(super) fn new() -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel(FS_EVENT_BUFFER);
        let overflow = Arc::new(Overflow::default());

        let overflow_cb = Arc::clone(&overflow);
        let fs = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(e) => e,
                Err(err) => {
                    debug!(error = %err, "file watcher error");
                    overflow_cb.mark();
                    return;
                }
            };

            // Backends emit `Other` (or drop paths) when details are unreliable.
            if matches!(event.kind, EventKind::Other) || event.paths.is_empty() {
                overflow_cb.mark();
                return;
            }
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            if tx.try_send(event).is_err() {
                overflow_cb.mark();
            }
        })?;

        Ok(Self {
            state: Arc::new(PushState {
                fs: Mutex::new(fs),
                watched: Mutex::new(HashSet::new()),
                contexts: RwLock::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                overflow,
            }),
            rx,
        })
    }

    pub(super) fn state(&self) -> Arc<PushState> {
        Arc::clone(&self.state)
    }
}

impl WatchStrategy for PushStrategy {
    fn mode(&self) -> WatchMode {
        WatchMode::Push
    }

    fn spawn(self: Box<Self>, core: Arc<Core>) {
        let Self { state, rx } = *self;
        tokio::spawn(run(state, rx, core));
    }
}

async fn run(state: Arc<PushState>, mut rx: mpsc::Receiver<notify::Event>, core: Arc<Core>) {
    // Watches go in first so nothing written during the initial read is missed.
    state.watch_tree(&core);
    core.initial_ingest().await;

    let cleanup_every = core.config.cleanup_interval();
    let mut cleanup = interval_at(Instant::now() + cleanup_every, cleanup_every);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = core.shutdown.cancelled() => break,
            _ = cleanup.tick() => {
                core.tailer.prune_missing();
                state.prune(&core);
            }
            _ = state.overflow.wake.notified() => {
                if state.overflow.take() {
                    state.rescan(&core);
                }
            }
            Some(event) = rx.recv() => state.handle_event(&core, event),
        }
    }

    state.cancel_timers();
    debug!("push loop stopped");
}

impl PushState {
    pub(super) fn pending_timers(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn watch_dir(&self, dir: &Path) {
        {
            let mut watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner);
            if !watched.insert(dir.to_path_buf()) {
                return;
            }
        }
        let result = self
            .fs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .watch(dir, RecursiveMode::NonRecursive);
        if let Err(e) = result {
            debug!(path = %dir.display(), error = %e, "failed to watch directory");
            self.watched
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(dir);
        }
    }

    /// Remember which session a file belongs to and watch it.
    fn track_file(&self, path: &Path, context: FileContext) {
        let added = self
            .contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), context)
            .is_none();
        if !added {
            return;
        }
        let result = self
            .fs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .watch(path, RecursiveMode::NonRecursive);
        if let Err(e) = result {
            // The parent directory watch still reports writes.
            trace!(path = %path.display(), error = %e, "failed to watch file");
        }
    }

    fn context(&self, path: &Path) -> Option<FileContext> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    fn is_tracked(&self, path: &Path) -> bool {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(path)
    }

    /// Watch a session's directories and log files.
    fn register_session(&self, session: &Session) {
        let main = session.main_path();
        if let Some(project) = main.parent() {
            self.watch_dir(project);
        }
        for dir in [
            paths::session_dir(main),
            paths::subagents_dir(main),
            paths::tool_results_dir(main),
        ] {
            if dir.is_dir() {
                self.watch_dir(&dir);
            }
        }

        self.track_file(
            main,
            FileContext {
                session_id: session.id().to_string(),
                agent_id: None,
            },
        );
        for (agent_id, path) in session.subagents() {
            self.track_file(
                &path,
                FileContext {
                    session_id: session.id().to_string(),
                    agent_id: Some(agent_id),
                },
            );
        }
    }

    /// Root, project directories and every monitored session.
    fn watch_tree(&self, core: &Core) {
        self.watch_dir(&core.root);
        if let Ok(entries) = std::fs::read_dir(&core.root) {
            for entry in entries.flatten() {
                if entry.file_type().is_ok_and(|t| t.is_dir()) {
                    self.watch_dir(&entry.path());
                }
            }
        }
        for session in core.registry.snapshot() {
            self.register_session(&session);
        }
    }

    fn handle_event(self: &Arc<Self>, core: &Arc<Core>, event: notify::Event) {
        trace!(kind = ?event.kind, paths = ?event.paths, "fs event");
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                for path in event.paths {
                    self.handle_create(core, path);
                }
            }
            EventKind::Modify(_) => {
                for path in event.paths {
                    self.handle_write(core, path);
                }
            }
            EventKind::Any => self.overflow.mark(),
            _ => {}
        }
    }

    /// A write to a file: tail it after the debounce if it's tracked. Writes to an
    /// unmonitored main log adopt that session when auto-discovery is on.
    fn handle_write(self: &Arc<Self>, core: &Arc<Core>, path: PathBuf) {
        if self.is_tracked(&path) {
            self.schedule(core, path);
            return;
        }
        if paths::classify(&core.root, &path) != PathKind::MainSession
            || !core.auto_discovery.load(Ordering::Relaxed)
        {
            return;
        }
        if let Some(session) = core.adopt_session(&path) {
            self.register_session(&session);
            core.check_background_tasks(&session);
            self.schedule(core, path);
        }
    }

    fn handle_create(self: &Arc<Self>, core: &Arc<Core>, path: PathBuf) {
        let Ok(meta) = std::fs::metadata(&path) else {
            return;
        };
        if meta.is_dir() {
            self.handle_new_dir(core, &path);
            return;
        }

        match paths::classify(&core.root, &path) {
            PathKind::Subagent { session_id, .. } => {
                if let Some(session) = core.registry.get(&session_id) {
                    for (agent_id, agent_path) in core.check_new_subagents(&session) {
                        self.track_file(
                            &agent_path,
                            FileContext {
                                session_id: session_id.clone(),
                                agent_id: Some(agent_id),
                            },
                        );
                    }
                }
            }
            PathKind::ToolResult { session_id, .. } => {
                if let Some(session) = core.registry.get(&session_id) {
                    core.check_background_tasks(&session);
                }
                return;
            }
            _ => {}
        }
        self.handle_write(core, path);
    }

    /// Watch a new directory in the layout and handle whatever is already inside.
    fn handle_new_dir(self: &Arc<Self>, core: &Arc<Core>, dir: &Path) {
        let relevant = match paths::classify(&core.root, dir) {
            PathKind::ProjectDir => true,
            PathKind::SessionDir { session_id }
            | PathKind::SubagentsDir { session_id }
            | PathKind::ToolResultsDir { session_id } => core.registry.contains(&session_id),
            _ => false,
        };
        if !relevant {
            return;
        }

        self.watch_dir(dir);
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            self.handle_create(core, entry.path());
        }
    }

    /// (Re)arm the debounce timer for `path`.
    fn schedule(self: &Arc<Self>, core: &Arc<Core>, path: PathBuf) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if core.shutdown.is_cancelled() {
            return;
        }
        if let Some(previous) = timers.remove(&path) {
            previous.cancel.cancel();
        }
        let cancel = core.shutdown.child_token();
        tokio::spawn(Arc::clone(self).fire(
            Arc::clone(core),
            path.clone(),
            seq,
            cancel.clone(),
        ));
        timers.insert(path, DebounceTimer { seq, cancel });
    }

    async fn fire(
        self: Arc<Self>,
        core: Arc<Core>,
        path: PathBuf,
        seq: u64,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(core.config.debounce()) => {}
        }

        // Only the newest timer for a path reads; it leaves the table first so a
        // write during the pass arms a fresh timer.
        {
            let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
            match timers.get(&path) {
                Some(t) if t.seq == seq => {
                    timers.remove(&path);
                }
                _ => return,
            }
        }

        let Some(context) = self.context(&path) else {
            return;
        };
        let Some(session) = core.registry.get(&context.session_id) else {
            return;
        };
        core.tail_file(&path, &context.session_id, context.agent_id.as_deref())
            .await;
        correlator::refresh_completion(&session);
    }

    /// Full pass on its own task, then watch anything it found.
    fn rescan(self: &Arc<Self>, core: &Arc<Core>) {
        warn!("file notifications lost; rescanning");
        let state = Arc::clone(self);
        let core = Arc::clone(core);
        tokio::spawn(async move {
            state.watch_tree(&core);
            core.reconcile().await;
            state.watch_tree(&core);
        });
    }

    fn cancel_timers(&self) {
        let drained: Vec<DebounceTimer> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, t)| t)
            .collect();
        for timer in drained {
            timer.cancel.cancel();
        }
    }

    /// Forget deleted files and files of sessions no longer monitored.
    fn prune(&self, core: &Core) {
        let tracked: Vec<(PathBuf, String)> = self
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(path, ctx)| (path.clone(), ctx.session_id.clone()))
            .collect();
        let stale: Vec<PathBuf> = tracked
            .into_iter()
            .filter(|(path, session_id)| !core.registry.contains(session_id) || !path.exists())
            .map(|(path, _)| path)
            .collect();

        let dirs: Vec<PathBuf> = self
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        let gone_dirs: Vec<PathBuf> = dirs.into_iter().filter(|d| !d.exists()).collect();

        if !stale.is_empty() {
            let mut contexts = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
            for path in &stale {
                contexts.remove(path);
            }
        }
        if !gone_dirs.is_empty() {
            let mut watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner);
            for dir in &gone_dirs {
                watched.remove(dir);
            }
        }
        if !stale.is_empty() || !gone_dirs.is_empty() {
            debug!(files = stale.len(), dirs = gone_dirs.len(), "pruned watch state");
        }
    }
}
