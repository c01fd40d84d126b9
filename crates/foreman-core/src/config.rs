//! Instance configuration, loaded from `.foreman/config.yaml`.
//!
//! The config file holds process-level tunables (loop intervals, per-kind
//! worker commands). Behavior gates that must survive restarts and be
//! auditable (caps, auto-approve, stale timeout) live in the policy table
//! instead.

use crate::error::Result;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

/// Per-kind worker settings. `command` is the external program that
/// performs the step's domain logic (step JSON on stdin, output JSON on
/// stdout); when absent, the CLI falls back to its builtin echo executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub command: Option<String>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Seconds between heartbeat ticks.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds a worker sleeps after an empty poll.
    #[serde(default = "default_worker_poll")]
    pub worker_poll_secs: u64,
    /// Step kind → worker settings.
    #[serde(default)]
    pub workers: HashMap<String, WorkerConfig>,
}

fn default_heartbeat_interval() -> u64 {
    300
}

fn default_worker_poll() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            worker_poll_secs: default_worker_poll(),
            workers: HashMap::new(),
        }
    }
}

impl Config {
    /// Load from `<root>/.foreman/config.yaml`; a missing file means
    /// defaults, a malformed file is an error.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn worker_poll(&self) -> Duration {
        Duration::from_secs(self.worker_poll_secs)
    }

    pub fn worker_command(&self, kind: &str) -> Option<&str> {
        self.workers.get(kind).and_then(|w| w.command.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.heartbeat_interval_secs, 300);
        assert_eq!(config.worker_poll_secs, 5);
        assert!(config.workers.is_empty());
    }

    #[test]
    fn roundtrip_preserves_worker_commands() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.heartbeat_interval_secs = 60;
        config.workers.insert(
            "analyze".into(),
            WorkerConfig {
                command: Some("./tools/analyze.sh".into()),
            },
        );
        config.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.heartbeat_interval_secs, 60);
        assert_eq!(loaded.worker_command("analyze"), Some("./tools/analyze.sh"));
        assert_eq!(loaded.worker_command("generate"), None);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".foreman")).unwrap();
        std::fs::write(
            dir.path().join(".foreman/config.yaml"),
            "heartbeat_interval_secs: 30\n",
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.worker_poll_secs, 5);
    }
}
