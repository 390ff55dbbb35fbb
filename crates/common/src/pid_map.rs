use crate::persist::{read_json, write_json_atomic, Loaded};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use tracing::warn;

/// Last known process of a task, with the start time observed when it was
/// bound (millisecond precision, unlike the OS process table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredEntry")]
pub struct SavedPid {
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl SavedPid {
    pub fn new(pid: u32, started_at: Option<DateTime<Utc>>) -> Self {
        Self { pid, started_at }
    }
}

/// Older files stored the bare pid.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Bare(u32),
    Full {
        pid: u32,
        #[serde(default)]
        started_at: Option<DateTime<Utc>>,
    },
}

impl From<StoredEntry> for SavedPid {
    fn from(entry: StoredEntry) -> Self {
        match entry {
            StoredEntry::Bare(pid) => Self::new(pid, None),
            StoredEntry::Full { pid, started_at } => Self::new(pid, started_at),
        }
    }
}

/// Durable task id -> last known pid. A restoration hint only; every entry is
/// revalidated against the live process table before it is trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PidMap {
    entries: BTreeMap<String, SavedPid>,
}

impl PidMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from disk. A missing or unreadable file yields an empty map.
    pub fn load(path: &Path) -> Self {
        match read_json::<PidMap>(path) {
            Ok(Loaded::Parsed(map)) => map,
            Ok(Loaded::Missing) => Self::new(),
            Ok(Loaded::Corrupt(reason)) => {
                warn!(path = %path.display(), %reason, "pid map is corrupt, starting empty");
                Self::new()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "pid map unreadable, starting empty");
                Self::new()
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        write_json_atomic(path, self)
    }

    pub fn get(&self, task_id: &str) -> Option<SavedPid> {
        self.entries.get(task_id).copied()
    }

    /// Returns true when the stored value changed.
    pub fn insert(&mut self, task_id: &str, entry: SavedPid) -> bool {
        self.entries.insert(task_id.to_string(), entry) != Some(entry)
    }

    /// Returns true when an entry was removed.
    pub fn remove(&mut self, task_id: &str) -> bool {
        self.entries.remove(task_id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, SavedPid)> {
        self.entries.iter().map(|(id, entry)| (id.as_str(), *entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pids.json");
        let started = Utc.timestamp_millis_opt(1_700_000_000_900).unwrap();

        let mut map = PidMap::new();
        assert!(map.insert("build", SavedPid::new(4242, Some(started))));
        assert!(!map.insert("build", SavedPid::new(4242, Some(started))));
        map.insert("serve", SavedPid::new(7, None));
        map.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["build"]["pid"], 4242);
        assert!(raw["serve"].get("started_at").is_none());

        let loaded = PidMap::load(&path);
        assert_eq!(loaded, map);
        assert_eq!(loaded.get("serve"), Some(SavedPid::new(7, None)));
        // Sub-second precision survives the round trip through disk.
        assert_eq!(loaded.get("build").unwrap().started_at, Some(started));
    }

    #[test]
    fn bare_pid_entries_still_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pids.json");
        std::fs::write(&path, br#"{"old": 31, "new": {"pid": 32}}"#).unwrap();

        let loaded = PidMap::load(&path);
        assert_eq!(loaded.get("old"), Some(SavedPid::new(31, None)));
        assert_eq!(loaded.get("new"), Some(SavedPid::new(32, None)));
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pids.json");
        std::fs::write(&path, b"[1, 2").unwrap();
        assert!(PidMap::load(&path).is_empty());
    }
}
