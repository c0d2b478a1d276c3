//! Stream events and watcher notifications

use crate::session::BackgroundTask;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Label used for events that come from the main session log.
pub const MAIN_AGENT_NAME: &str = "Main";

/// Number of agent id characters kept in a subagent's display name.
pub const AGENT_ID_DISPLAY_LEN: usize = 7;

/// Display name for an agent id (`""` is the main session).
pub fn agent_display_name(agent_id: &str) -> String {
    if agent_id.is_empty() {
        return MAIN_AGENT_NAME.to_string();
    }
    format!("Agent-{}", crate::truncate(agent_id, AGENT_ID_DISPLAY_LEN))
}

/// What a stream event carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Thinking,
    ToolInput,
    ToolOutput,
    Text,
}

/// One typed event extracted from a session log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub kind: StreamKind,
    pub session_id: String,
    /// Originating agent; empty for the main session
    #[serde(skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    /// Correlates a tool input with its output
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tool_id: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl StreamEvent {
    pub(crate) fn new(
        kind: StreamKind,
        agent_id: &str,
        timestamp: DateTime<Utc>,
        content: String,
    ) -> Self {
        Self {
            kind,
            session_id: String::new(),
            agent_id: agent_id.to_string(),
            agent_name: agent_display_name(agent_id),
            timestamp,
            content,
            tool_name: String::new(),
            tool_id: String::new(),
            is_error: false,
        }
    }

    /// Stamp the owning session, and the file's agent unless the record named one.
    pub(crate) fn attributed(mut self, session_id: &str, agent_id: Option<&str>) -> Self {
        self.session_id = session_id.to_string();
        if let Some(agent_id) = agent_id
            && !agent_id.is_empty()
            && self.agent_id.is_empty()
        {
            self.agent_id = agent_id.to_string();
            self.agent_name = agent_display_name(agent_id);
        }
        self
    }
}

/// A session appeared while auto-discovery was enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub session_id: String,
    pub project_path: String,
    pub path: PathBuf,
}

/// A subagent log appeared under a monitored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAgent {
    pub session_id: String,
    pub agent_id: String,
}

/// A tool-results artifact appeared under a monitored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBackgroundTask {
    pub session_id: String,
    pub task: BackgroundTask,
}
