use chrono::{DateTime, Utc};
use fleet_common::pid_map::{PidMap, SavedPid};
use std::collections::{HashMap, HashSet};
use tokio::task::JoinHandle;

/// The process currently standing in for a task.
#[derive(Debug)]
pub struct TrackedProcess {
    pub pid: u32,
    pub started_at: Option<DateTime<Utc>>,
    /// Spawned by this supervisor (leads its own process group) rather than adopted.
    pub owned: bool,
    /// `started_at` was observed at spawn time rather than read back from
    /// the process table, which only keeps whole seconds.
    exact_start: bool,
    watchdog: Option<JoinHandle<()>>,
}

impl TrackedProcess {
    pub fn spawned(pid: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            pid,
            started_at: Some(started_at),
            owned: true,
            exact_start: true,
            watchdog: None,
        }
    }

    /// Found in the process table; `started_at` is the OS whole-second value.
    pub fn adopted(pid: u32, started_at: Option<DateTime<Utc>>) -> Self {
        Self {
            pid,
            started_at,
            owned: false,
            exact_start: false,
            watchdog: None,
        }
    }

    /// Re-attached after a restart with the start time recorded at spawn.
    pub fn restored(pid: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            pid,
            started_at: Some(started_at),
            owned: false,
            exact_start: true,
            watchdog: None,
        }
    }

    /// Instant the timeout budget counts from. Whole-second OS start times
    /// are rounded up so a budget never runs out before it should.
    pub fn timeout_origin(&self) -> Option<DateTime<Utc>> {
        let started_at = self.started_at?;
        if self.exact_start {
            Some(started_at)
        } else {
            Some(started_at + chrono::Duration::seconds(1))
        }
    }

    pub fn has_watchdog(&self) -> bool {
        self.watchdog
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn disarm(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
    }
}

/// Most recent completed run, kept in memory only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunRecord {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

/// Live bindings, durable pid hints and run history for one device.
///
/// Callers hold it behind a single mutex; every mutation goes through the
/// methods below. Methods touching the durable map report whether it
/// changed so the caller can persist it once the lock is released.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    live: HashMap<String, TrackedProcess>,
    saved: PidMap,
    history: HashMap<String, RunRecord>,
}

impl ProcessRegistry {
    pub fn new(saved: PidMap) -> Self {
        Self {
            live: HashMap::new(),
            saved,
            history: HashMap::new(),
        }
    }

    pub fn live(&self, task_id: &str) -> Option<&TrackedProcess> {
        self.live.get(task_id)
    }

    pub fn live_pid(&self, task_id: &str) -> Option<u32> {
        self.live.get(task_id).map(|tracked| tracked.pid)
    }

    /// Task currently bound to `pid`, if any.
    pub fn owner_of(&self, pid: u32) -> Option<&str> {
        self.live
            .iter()
            .find(|(_, tracked)| tracked.pid == pid)
            .map(|(task_id, _)| task_id.as_str())
    }

    pub fn claimed_pids(&self) -> HashSet<u32> {
        self.live.values().map(|tracked| tracked.pid).collect()
    }

    pub fn tracked(&self) -> Vec<(String, u32)> {
        self.live
            .iter()
            .map(|(task_id, tracked)| (task_id.clone(), tracked.pid))
            .collect()
    }

    /// Bind `task_id` to a process, replacing any previous binding.
    pub fn track(&mut self, task_id: &str, process: TrackedProcess) -> bool {
        let pid = process.pid;
        if let Some(mut previous) = self.live.insert(task_id.to_string(), process) {
            if previous.pid != pid {
                previous.disarm();
            } else if let Some(handle) = previous.watchdog.take() {
                match self.live.get_mut(task_id) {
                    Some(current) if current.watchdog.is_none() => current.watchdog = Some(handle),
                    _ => handle.abort(),
                }
            }
        }
        let exact = self
            .live
            .get(task_id)
            .filter(|tracked| tracked.exact_start)
            .and_then(|tracked| tracked.started_at);
        self.saved.insert(task_id, SavedPid::new(pid, exact))
    }

    /// Attach a watchdog to the current binding. Dropped if the task has moved on.
    pub fn set_watchdog(&mut self, task_id: &str, pid: u32, handle: JoinHandle<()>) {
        match self.live.get_mut(task_id) {
            Some(tracked) if tracked.pid == pid => {
                tracked.disarm();
                tracked.watchdog = Some(handle);
            }
            _ => handle.abort(),
        }
    }

    /// Drop the binding (only if it still points at `pid`, when given) and
    /// record the run as finished. Returns `(was_live, saved_changed)`.
    pub fn mark_finished(
        &mut self,
        task_id: &str,
        pid: Option<u32>,
        finished_at: DateTime<Utc>,
    ) -> (bool, bool) {
        let matches = match (self.live.get(task_id), pid) {
            (Some(tracked), Some(pid)) => tracked.pid == pid,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return (false, false);
        }
        let mut tracked = match self.live.remove(task_id) {
            Some(tracked) => tracked,
            None => return (false, false),
        };
        tracked.disarm();
        self.history.insert(
            task_id.to_string(),
            RunRecord {
                started_at: tracked.started_at,
                finished_at,
            },
        );
        let saved_changed = match self.saved.get(task_id) {
            Some(saved) if saved.pid == tracked.pid => self.saved.remove(task_id),
            _ => false,
        };
        (true, saved_changed)
    }

    pub fn saved_pid(&self, task_id: &str) -> Option<SavedPid> {
        self.saved.get(task_id)
    }

    pub fn forget_saved(&mut self, task_id: &str) -> bool {
        self.saved.remove(task_id)
    }

    pub fn saved_snapshot(&self) -> PidMap {
        self.saved.clone()
    }

    pub fn history(&self, task_id: &str) -> Option<RunRecord> {
        self.history.get(task_id).copied()
    }
}
