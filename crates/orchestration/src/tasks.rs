use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use fleet_common::persist::{read_json, write_json_atomic, Loaded};
use fleet_common::Task;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

/// Task definitions owned by this device, persisted in `<device_id>/tasks.json`.
///
/// Mutations run one at a time under `writer`: the change is applied to a
/// copy, written to disk off the runtime, and only then made visible.
pub struct TaskStore {
    path: PathBuf,
    tasks: Mutex<Vec<Task>>,
    writer: AsyncMutex<()>,
}

impl TaskStore {
    pub fn path_for(data_dir: &Path, device_id: &str) -> PathBuf {
        data_dir.join(device_id).join("tasks.json")
    }

    /// Open the store; a corrupt file is logged and treated as empty.
    pub fn open(path: PathBuf) -> Self {
        let mut tasks = match read_json::<Vec<Task>>(&path) {
            Ok(Loaded::Parsed(tasks)) => tasks,
            Ok(Loaded::Missing) => Vec::new(),
            Ok(Loaded::Corrupt(reason)) => {
                warn!(path = %path.display(), %reason, "task file corrupt, starting empty");
                Vec::new()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "task file unreadable, starting empty");
                Vec::new()
            }
        };
        tasks.sort_by_key(|task| task.order);
        Self {
            path,
            tasks: Mutex::new(tasks),
            writer: AsyncMutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `change` to a copy of the list. When it returns `Some`, the copy
    /// is saved and then replaces the in-memory list; a failed save leaves
    /// memory untouched.
    async fn commit<R, F>(&self, change: F) -> io::Result<Option<R>>
    where
        F: FnOnce(&mut Vec<Task>) -> Option<R>,
    {
        let _writer = self.writer.lock().await;
        let mut next = self.list();
        let Some(result) = change(&mut next) else {
            return Ok(None);
        };
        let path = self.path.clone();
        let snapshot = next.clone();
        tokio::task::spawn_blocking(move || write_json_atomic(&path, &snapshot))
            .await
            .map_err(io::Error::other)??;
        *self.lock() = next;
        Ok(Some(result))
    }

    /// All tasks in display order.
    pub fn list(&self) -> Vec<Task> {
        self.lock().clone()
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.lock().iter().find(|task| task.id == task_id).cloned()
    }

    /// Append a task after the current last one.
    pub async fn insert(&self, mut task: Task) -> io::Result<Task> {
        let inserted = self
            .commit(move |tasks| {
                task.order = tasks.iter().map(|t| t.order + 1).max().unwrap_or(0);
                tasks.push(task.clone());
                Some(task)
            })
            .await?;
        inserted.ok_or_else(|| io::Error::other("task insert produced no entry"))
    }

    /// Apply `change` to one task and persist. `None` when the id is unknown.
    pub async fn update<F>(&self, task_id: &str, change: F) -> io::Result<Option<Task>>
    where
        F: FnOnce(&mut Task),
    {
        self.commit(|tasks| {
            let task = tasks.iter_mut().find(|task| task.id == task_id)?;
            change(task);
            Some(task.clone())
        })
        .await
    }

    pub async fn remove(&self, task_id: &str) -> io::Result<Option<Task>> {
        self.commit(|tasks| {
            let index = tasks.iter().position(|task| task.id == task_id)?;
            Some(tasks.remove(index))
        })
        .await
    }

    /// Listed ids first, in the given order; the rest keep their relative
    /// order after them. Order indexes are rewritten.
    pub async fn reorder(&self, ids: &[String]) -> io::Result<()> {
        self.commit(|tasks| {
            let mut ordered: Vec<Task> = Vec::with_capacity(tasks.len());
            for id in ids {
                if let Some(index) = tasks.iter().position(|task| &task.id == id) {
                    ordered.push(tasks.remove(index));
                }
            }
            ordered.append(tasks);
            for (order, task) in ordered.iter_mut().enumerate() {
                task.order = order;
            }
            *tasks = ordered;
            Some(())
        })
        .await?;
        Ok(())
    }
}
