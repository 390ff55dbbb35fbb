use fleet_common::Task;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_STOP_GRACE_MS: u64 = 2_000;
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
pub const DEFAULT_LOG_TAIL_LINES: usize = 500;
pub const LOG_CHANNEL_CAPACITY: usize = 1_024;

pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_SYNC_OVERALL_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 2_000;

/// Interpreter fallback when the local identity carries no override.
pub const PYTHON_EXEC_ENV: &str = "FLEETD_PYTHON_EXEC";

/// `[supervisor]` section of the daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorSettings {
    pub stop_grace_ms: u64,
    pub log_rotate_bytes: u64,
    /// Minimum spacing between full process-table scans; 0 scans on every reconciliation.
    pub deep_scan_min_interval_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            log_rotate_bytes: DEFAULT_LOG_ROTATE_BYTES,
            deep_scan_min_interval_ms: 0,
        }
    }
}

impl SupervisorSettings {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn deep_scan_min_interval(&self) -> Duration {
        Duration::from_millis(self.deep_scan_min_interval_ms)
    }
}

/// `[fleet]` section of the daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetSettings {
    pub peer_timeout_ms: u64,
    pub sync_timeout_ms: u64,
    pub sync_overall_timeout_ms: u64,
    pub broadcast_interval_ms: u64,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            peer_timeout_ms: DEFAULT_PEER_TIMEOUT_MS,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            sync_overall_timeout_ms: DEFAULT_SYNC_OVERALL_TIMEOUT_MS,
            broadcast_interval_ms: DEFAULT_BROADCAST_INTERVAL_MS,
        }
    }
}

impl FleetSettings {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn sync_overall_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_overall_timeout_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms.max(1))
    }
}

/// Everything a device needs to launch one run of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub task_id: String,
    pub command: String,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    /// Seconds; `None` disables the watchdog.
    pub timeout: Option<u64>,
}

impl LaunchSpec {
    /// Launch request for a device that owns the definition itself (a peer).
    pub fn by_id(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            command: String::new(),
            cwd: None,
            env: HashMap::new(),
            timeout: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl From<&Task> for LaunchSpec {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            command: task.command.clone(),
            cwd: task.cwd.clone(),
            env: task.env.clone(),
            timeout: task.timeout_secs(),
        }
    }
}

/// One decoded line of task output, as fanned out to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub task_id: String,
    pub line: String,
}
