// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod command;
pub mod persist;
pub mod pid_map;
pub mod process_utils;
pub mod related;
pub mod spawn_error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Persisted task definition. Owned by exactly one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub description: Option<String>,
    pub device_id: String,
    #[serde(default)]
    pub schedule: Option<String>,
    /// Seconds; `None` or `0` disables the watchdog.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub order: usize,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn timeout_secs(&self) -> Option<u64> {
        self.timeout.filter(|secs| *secs > 0)
    }

    pub fn schedule_expr(&self) -> Option<&str> {
        self.schedule
            .as_deref()
            .map(str::trim)
            .filter(|expr| !expr.is_empty())
    }
}

/// Transient, recomputed status of a task. Never the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskStatus {
    pub id: String,
    pub running: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cpu_percent: Option<f32>,
    #[serde(default)]
    pub memory_rss: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskStatus {
    pub fn idle(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Task definition merged with its live status, as served to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NewTask {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
    Error { message: String },
}

impl StartOutcome {
    pub fn pid(&self) -> Option<u32> {
        match self {
            StartOutcome::Started { pid } | StartOutcome::AlreadyRunning { pid } => Some(*pid),
            StartOutcome::Error { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    NotRunning,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KillOutcome {
    Killed,
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AssociateOutcome {
    Associated {
        pid: u32,
        #[serde(default)]
        started_at: Option<DateTime<Utc>>,
        #[serde(default)]
        cmdline: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    Error {
        message: String,
    },
}

/// Generic acknowledgement for configuration-style calls (rename, config push).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AckOutcome {
    Ok,
    Error { message: String },
}

impl AckOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, AckOutcome::Ok)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub python_exec: Option<String>,
}

/// Identity/health payload served by every agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStatus {
    pub status: String,
    pub hostname: String,
    /// Display name; older agents only report the hostname.
    #[serde(default)]
    pub name: String,
    pub platform: String,
    pub id: String,
    #[serde(default)]
    pub python_exec: Option<String>,
}

/// A system process scored against a task command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelatedProcess {
    pub pid: u32,
    pub name: String,
    pub exe: String,
    pub cmdline: String,
    pub cmd_args: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub memory_rss: u64,
    pub score: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequestItem {
    pub id: String,
    pub command: String,
}
