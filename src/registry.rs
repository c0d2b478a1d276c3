//! Session registry - the authoritative set of monitored sessions

use crate::session::Session;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Sessions keyed by id.
///
/// Callers get `Arc<Session>` snapshots and release the lock before doing any I/O.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless a session with the same id exists. Check and insert happen
    /// under one write lock. Returns the inserted session.
    pub fn insert_if_absent(&self, session: Session) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(session.id()) {
            return None;
        }
        let session = Arc::new(session);
        info!(session_id = %session.id(), project = %session.project_path(), "monitoring session");
        sessions.insert(session.id().to_string(), Arc::clone(&session));
        Some(session)
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if removed.is_some() {
            debug!(%session_id, "session removed");
        }
        removed
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    /// All sessions, sorted by id.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut out: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        out
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
