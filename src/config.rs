//! Watcher tunables.
//!
//! Defaults match what the watcher has always used. Users can override any of them in
//! `config.json` under the platform config directory (`~/.config/claude-esp/` on Linux,
//! `~/Library/Application Support/claude-esp/` on macOS).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Timing, threshold and buffer settings for a [`crate::Watcher`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Poll-mode tick.
    pub poll_interval_ms: u64,
    /// Quiet period before a burst of writes to one file is tailed (push mode).
    pub debounce_ms: u64,
    /// Sessions modified within this window are picked up by active discovery.
    pub active_window_secs: u64,
    /// Above this many existing lines, startup skips to the tail of each file.
    pub history_line_threshold: usize,
    /// Lines kept per file when history is skipped.
    pub keep_recent_lines: usize,
    /// How often offsets for deleted files are pruned.
    pub cleanup_interval_secs: u64,
    /// Listing rows are flagged active when modified within this window.
    pub recent_activity_secs: u64,
    /// Capacity of the stream event channel.
    pub event_buffer: usize,
    /// Capacity of the error and notification channels.
    pub notify_buffer: usize,
    /// Longest log line accepted before it is reported and skipped.
    pub max_line_bytes: usize,
    /// Never try filesystem notifications.
    pub force_poll: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            debounce_ms: 50,
            active_window_secs: 5 * 60,
            history_line_threshold: 100,
            keep_recent_lines: 10,
            cleanup_interval_secs: 5 * 60,
            recent_activity_secs: 2 * 60,
            event_buffer: 100,
            notify_buffer: 10,
            max_line_bytes: 1024 * 1024,
            force_poll: false,
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn active_window(&self) -> Duration {
        Duration::from_secs(self.active_window_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn recent_activity(&self) -> Duration {
        Duration::from_secs(self.recent_activity_secs)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("claude-esp"))
}

/// Load config from disk, returning defaults if the file is missing or invalid.
pub fn load() -> WatcherConfig {
    let Some(path) = config_dir().map(|d| d.join("config.json")) else {
        return WatcherConfig::default();
    };
    load_from(&path)
}

fn load_from(path: &Path) -> WatcherConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
                WatcherConfig::default()
            }
        },
        Err(_) => WatcherConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load_from(&tmp.path().join("nope.json"));
        assert_eq!(config, WatcherConfig::default());
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.active_window(), Duration::from_secs(300));
    }

    #[test]
    fn partial_file_overrides_only_given_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{ "debounce_ms": 20, "force_poll": true }"#).unwrap();

        let config = load_from(&path);
        assert_eq!(config.debounce(), Duration::from_millis(20));
        assert!(config.force_poll);
        assert_eq!(config.keep_recent_lines, 10);
        assert_eq!(config.history_line_threshold, 100);
    }

    #[test]
    fn invalid_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(load_from(&path), WatcherConfig::default());
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let config = WatcherConfig {
            poll_interval_ms: 0,
            cleanup_interval_secs: 0,
            ..WatcherConfig::default()
        };
        assert!(!config.poll_interval().is_zero());
        assert!(!config.cleanup_interval().is_zero());
    }
}
