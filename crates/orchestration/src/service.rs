use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_common::command::join_argv;
use fleet_common::{
    AssociateOutcome, KillOutcome, NewTask, RelatedProcess, StartOutcome, StopOutcome, Task,
    TaskUpdate, TaskView,
};
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::Device;
use crate::error::{RemoteError, TaskError};
use crate::hub::EventHub;
use crate::manager::DeviceManager;
use crate::remote::RemoteDevice;
use crate::scheduler::{self, CronScheduler};
use crate::tasks::TaskStore;
use crate::types::LaunchSpec;

/// Broadcast ticks between reconciliations while nobody is subscribed.
const IDLE_SCAN_EVERY: u64 = 15;

enum Route {
    Local,
    Remote(RemoteDevice),
}

/// Task CRUD, routing to the owning device, cron triggers and the
/// periodic fleet broadcast.
pub struct TaskManager {
    devices: Arc<DeviceManager>,
    store: TaskStore,
    scheduler: CronScheduler,
    hub: Arc<EventHub>,
    broadcast_interval: Duration,
}

/// `None` for empty or whitespace-only optional text fields.
fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn remote_failure(task_id: &str, err: RemoteError) -> TaskError {
    match err.status() {
        Some(404) => TaskError::NotFound(task_id.to_string()),
        Some(400) => TaskError::InvalidRequest(err.to_string()),
        _ => TaskError::Remote(err),
    }
}

impl TaskManager {
    /// Build the manager. The returned receiver yields task ids whose cron
    /// trigger fired; hand it to [`TaskManager::spawn_background`].
    pub fn new(
        devices: Arc<DeviceManager>,
        hub: Arc<EventHub>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (fire, fired) = mpsc::unbounded_channel();
        let store = TaskStore::open(TaskStore::path_for(devices.data_dir(), &devices.local_id()));
        let broadcast_interval = devices.settings().broadcast_interval();
        let manager = Self {
            devices,
            store,
            scheduler: CronScheduler::new(fire),
            hub,
            broadcast_interval,
        };
        (manager, fired)
    }

    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.devices
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn scheduler(&self) -> &CronScheduler {
        &self.scheduler
    }

    /// Reattach to processes that outlived the previous daemon, re-arm their
    /// timeouts and install cron triggers.
    pub async fn bootstrap(&self) {
        let tasks = self.store.list();
        let local = self.devices.local();
        local.scan(&tasks).await;
        local.restore_timeouts(&tasks).await;
        for task in &tasks {
            let Some(expr) = task.schedule_expr() else { continue };
            if let Err(err) = self.scheduler.set(&task.id, Some(expr)) {
                warn!(task_id = %task.id, error = %err, "skipping invalid schedule");
            }
        }
        info!(
            tasks = tasks.len(),
            schedules = self.scheduler.len(),
            "task manager bootstrapped"
        );
    }

    /// Start the broadcast loop and the cron consumer.
    pub fn spawn_background(
        self: &Arc<Self>,
        mut fired: mpsc::UnboundedReceiver<String>,
    ) -> Vec<JoinHandle<()>> {
        let broadcaster = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(manager.broadcast_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut idle_ticks: u64 = 0;
                loop {
                    ticker.tick().await;
                    if manager.hub.task_subscribers() > 0 {
                        idle_ticks = 0;
                        let views = manager.list_fleet().await;
                        manager.hub.publish_tasks(views);
                        continue;
                    }
                    idle_ticks += 1;
                    if idle_ticks % IDLE_SCAN_EVERY == 0 {
                        let tasks = manager.store.list();
                        manager.devices.local().scan(&tasks).await;
                    }
                }
            })
        };

        let cron = {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(task_id) = fired.recv().await {
                    match manager.start(None, &task_id).await {
                        Ok(StartOutcome::Error { message }) => {
                            warn!(%task_id, %message, "scheduled start failed")
                        }
                        Ok(outcome) => info!(%task_id, pid = ?outcome.pid(), "scheduled start"),
                        Err(TaskError::NotFound(_)) => manager.scheduler.remove(&task_id),
                        Err(err) => warn!(%task_id, error = %err, "scheduled start failed"),
                    }
                }
            })
        };

        vec![broadcaster, cron]
    }

    fn route(&self, device: Option<&str>) -> Result<Route, TaskError> {
        match device.map(str::trim).filter(|key| !key.is_empty()) {
            None => Ok(Route::Local),
            Some(key) if self.devices.is_local(key) => Ok(Route::Local),
            Some(key) => self
                .devices
                .remote(key)
                .map(Route::Remote)
                .ok_or_else(|| TaskError::DeviceNotFound(key.to_string())),
        }
    }

    fn local_task(&self, task_id: &str) -> Result<Task, TaskError> {
        self.store
            .get(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    async fn view(&self, task: Task) -> TaskView {
        let status = self.devices.local().task_status(&task.id).await;
        TaskView { task, status }
    }

    /// Local tasks with freshly reconciled status.
    pub async fn list_local(&self) -> Vec<TaskView> {
        let tasks = self.store.list();
        self.devices.local().scan(&tasks).await;
        let mut views = Vec::with_capacity(tasks.len());
        for task in tasks {
            views.push(self.view(task).await);
        }
        views
    }

    /// Tasks of one device: this one when `device` is absent or local.
    pub async fn list(&self, device: Option<&str>) -> Result<Vec<TaskView>, TaskError> {
        match self.route(device)? {
            Route::Local => Ok(self.list_local().await),
            Route::Remote(remote) => remote.list_tasks().await.map_err(TaskError::Remote),
        }
    }

    /// Local tasks followed by every reachable peer's tasks. A failing peer
    /// contributes nothing and does not hold up the others.
    pub async fn list_fleet(&self) -> Vec<TaskView> {
        let remotes = self.devices.remotes();
        let (mut views, remote_lists) = tokio::join!(
            self.list_local(),
            join_all(remotes.iter().map(|remote| remote.list_tasks()))
        );
        for (remote, listed) in remotes.iter().zip(remote_lists) {
            match listed {
                Ok(remote_views) => views.extend(remote_views),
                Err(err) => debug!(peer = %remote.id(), error = %err, "peer left out of fleet list"),
            }
        }
        views
    }

    pub async fn get(&self, device: Option<&str>, task_id: &str) -> Result<TaskView, TaskError> {
        match self.route(device)? {
            Route::Local => {
                let task = self.local_task(task_id)?;
                Ok(self.view(task).await)
            }
            Route::Remote(remote) => remote
                .get_task(task_id)
                .await
                .map_err(|err| remote_failure(task_id, err)),
        }
    }

    /// Create a task on the device named by `new.device_id` (this one when absent).
    pub async fn create(&self, new: NewTask) -> Result<Task, TaskError> {
        if new.name.trim().is_empty() || new.command.trim().is_empty() {
            return Err(TaskError::InvalidRequest(
                "name and command are required".to_string(),
            ));
        }
        scheduler::validate(new.schedule.as_deref())?;
        match self.route(new.device_id.as_deref())? {
            Route::Remote(remote) => remote
                .create_task(&new)
                .await
                .map_err(|err| remote_failure("", err)),
            Route::Local => {
                let task = Task {
                    id: Uuid::new_v4().to_string(),
                    name: new.name.trim().to_string(),
                    command: new.command.trim().to_string(),
                    cwd: non_empty(new.cwd),
                    env: new.env,
                    description: non_empty(new.description),
                    device_id: self.devices.local_id(),
                    schedule: non_empty(new.schedule),
                    timeout: new.timeout.filter(|secs| *secs > 0),
                    order: 0,
                    created_at: Utc::now(),
                };
                let task = self.store.insert(task).await?;
                self.scheduler.set(&task.id, task.schedule_expr())?;
                info!(task_id = %task.id, name = %task.name, "task created");
                Ok(task)
            }
        }
    }

    /// Apply a partial update. Empty strings clear optional fields and a
    /// zero timeout disables the watchdog.
    pub async fn update(
        &self,
        device: Option<&str>,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<Task, TaskError> {
        if let Some(expr) = update.schedule.as_deref() {
            scheduler::validate(Some(expr))?;
        }
        let route = self.route(device)?;
        if let Route::Remote(remote) = route {
            return remote
                .update_task(task_id, &update)
                .await
                .map_err(|err| remote_failure(task_id, err));
        }

        let updated = self.store.update(task_id, |task| {
            if let Some(name) = non_empty(update.name) {
                task.name = name;
            }
            if let Some(command) = non_empty(update.command) {
                task.command = command;
            }
            if let Some(cwd) = update.cwd {
                task.cwd = non_empty(Some(cwd));
            }
            if let Some(env) = update.env {
                task.env = env;
            }
            if let Some(description) = update.description {
                task.description = non_empty(Some(description));
            }
            if let Some(schedule) = update.schedule {
                task.schedule = non_empty(Some(schedule));
            }
            if let Some(timeout) = update.timeout {
                task.timeout = Some(timeout).filter(|secs| *secs > 0);
            }
        })
        .await?;
        let task = updated.ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        self.scheduler.set(&task.id, task.schedule_expr())?;
        debug!(%task_id, "task updated");
        Ok(task)
    }

    /// Remove the trigger, stop any live process, then drop the definition.
    pub async fn delete(&self, device: Option<&str>, task_id: &str) -> Result<(), TaskError> {
        match self.route(device)? {
            Route::Remote(remote) => remote
                .delete_task(task_id)
                .await
                .map_err(|err| remote_failure(task_id, err)),
            Route::Local => {
                self.local_task(task_id)?;
                self.scheduler.remove(task_id);
                if let StopOutcome::Error { message } =
                    self.devices.local().stop_task(task_id).await
                {
                    warn!(%task_id, %message, "stop during delete failed");
                }
                self.store.remove(task_id).await?;
                info!(%task_id, "task deleted");
                Ok(())
            }
        }
    }

    pub async fn reorder(&self, device: Option<&str>, ids: &[String]) -> Result<(), TaskError> {
        match self.route(device)? {
            Route::Remote(remote) => remote
                .reorder(ids)
                .await
                .map_err(|err| remote_failure("", err)),
            Route::Local => Ok(self.store.reorder(ids).await?),
        }
    }

    pub async fn start(
        &self,
        device: Option<&str>,
        task_id: &str,
    ) -> Result<StartOutcome, TaskError> {
        match self.route(device)? {
            Route::Remote(remote) => Ok(remote.start_task(&LaunchSpec::by_id(task_id)).await),
            Route::Local => {
                let task = self.local_task(task_id)?;
                Ok(self
                    .devices
                    .local()
                    .start_task(&LaunchSpec::from(&task))
                    .await)
            }
        }
    }

    /// Stopping an unknown or idle task is a no-op, not an error.
    pub async fn stop(&self, device: Option<&str>, task_id: &str) -> Result<StopOutcome, TaskError> {
        Ok(match self.route(device)? {
            Route::Remote(remote) => remote.stop_task(task_id).await,
            Route::Local => self.devices.local().stop_task(task_id).await,
        })
    }

    pub async fn logs(
        &self,
        device: Option<&str>,
        task_id: &str,
        lines: usize,
    ) -> Result<Vec<String>, TaskError> {
        Ok(match self.route(device)? {
            Route::Remote(remote) => remote.logs(task_id, lines).await,
            Route::Local => self.devices.local().logs(task_id, lines).await,
        })
    }

    pub async fn related(
        &self,
        device: Option<&str>,
        task_id: &str,
    ) -> Result<Vec<RelatedProcess>, TaskError> {
        match self.route(device)? {
            Route::Remote(remote) => Ok(remote.find_related(task_id, "").await),
            Route::Local => {
                let task = self.local_task(task_id)?;
                Ok(self
                    .devices
                    .local()
                    .find_related(task_id, &task.command)
                    .await)
            }
        }
    }

    pub async fn kill(&self, device: Option<&str>, pid: u32) -> Result<KillOutcome, TaskError> {
        Ok(match self.route(device)? {
            Route::Remote(remote) => remote.kill_process(pid).await,
            Route::Local => self.devices.local().kill_process(pid).await,
        })
    }

    /// Bind `pid` to the task and backfill its command line and working
    /// directory from the live process.
    pub async fn associate(
        &self,
        device: Option<&str>,
        task_id: &str,
        pid: u32,
    ) -> Result<AssociateOutcome, TaskError> {
        let local = match self.route(device)? {
            Route::Remote(remote) => return Ok(remote.associate(task_id, pid).await),
            Route::Local => self.devices.local(),
        };
        self.local_task(task_id)?;
        let outcome = local.associate(task_id, pid).await;
        if let AssociateOutcome::Associated { cmdline, cwd, .. } = &outcome {
            let command = (!cmdline.is_empty()).then(|| join_argv(cmdline));
            let cwd = cwd.clone();
            self.store.update(task_id, |task| {
                if let Some(command) = command {
                    task.command = command;
                }
                if let Some(cwd) = cwd {
                    task.cwd = Some(cwd);
                }
            })
            .await?;
            info!(%task_id, pid, "process associated");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FleetSettings, SupervisorSettings};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> TaskManager {
        let devices = DeviceManager::open(
            dir.path(),
            SupervisorSettings::default(),
            FleetSettings::default(),
            None,
        )
        .unwrap();
        let (manager, _fired) = TaskManager::new(Arc::new(devices), Arc::new(EventHub::new()));
        manager
    }

    fn new_task(name: &str, command: &str) -> NewTask {
        NewTask {
            name: name.into(),
            command: command.into(),
            ..NewTask::default()
        }
    }

    #[tokio::test]
    async fn create_validates_and_installs_schedule() {
        let dir = TempDir::new().unwrap();
        let tasks = manager(&dir);

        let bad = NewTask {
            schedule: Some("not a cron".into()),
            ..new_task("bad", "echo bad")
        };
        assert!(matches!(
            tasks.create(bad).await,
            Err(TaskError::InvalidSchedule(_))
        ));
        assert!(matches!(
            tasks.create(new_task(" ", "echo")).await,
            Err(TaskError::InvalidRequest(_))
        ));

        let created = tasks
            .create(NewTask {
                schedule: Some("*/10 * * * *".into()),
                timeout: Some(0),
                ..new_task("tick", "echo tick")
            })
            .await
            .unwrap();
        assert_eq!(created.device_id, tasks.devices().local_id());
        assert_eq!(created.timeout, None);
        assert_eq!(
            tasks.scheduler().expression(&created.id).as_deref(),
            Some("*/10 * * * *")
        );
    }

    #[tokio::test]
    async fn update_clears_fields_and_replaces_trigger() {
        let dir = TempDir::new().unwrap();
        let tasks = manager(&dir);
        let created = tasks
            .create(NewTask {
                schedule: Some("0 * * * *".into()),
                cwd: Some("/tmp".into()),
                timeout: Some(30),
                ..new_task("job", "echo job")
            })
            .await
            .unwrap();

        let updated = tasks
            .update(
                None,
                &created.id,
                TaskUpdate {
                    cwd: Some(String::new()),
                    schedule: Some("5 * * * *".into()),
                    timeout: Some(0),
                    env: Some(HashMap::from([("A".to_string(), "1".to_string())])),
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.cwd, None);
        assert_eq!(updated.timeout, None);
        assert_eq!(updated.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(
            tasks.scheduler().expression(&created.id).as_deref(),
            Some("5 * * * *")
        );

        tasks
            .update(
                None,
                &created.id,
                TaskUpdate {
                    schedule: Some("  ".into()),
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap();
        assert!(tasks.scheduler().is_empty());

        assert!(matches!(
            tasks.update(None, "missing", TaskUpdate::default()).await,
            Err(TaskError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_definition_and_trigger() {
        let dir = TempDir::new().unwrap();
        let tasks = manager(&dir);
        let created = tasks
            .create(NewTask {
                schedule: Some("0 * * * *".into()),
                ..new_task("gone", "echo gone")
            })
            .await
            .unwrap();

        tasks.delete(None, &created.id).await.unwrap();
        assert!(tasks.scheduler().is_empty());
        assert!(matches!(
            tasks.get(None, &created.id).await,
            Err(TaskError::NotFound(_))
        ));
        assert!(matches!(
            tasks.delete(None, &created.id).await,
            Err(TaskError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_device_and_task_are_reported() {
        let dir = TempDir::new().unwrap();
        let tasks = manager(&dir);
        assert!(matches!(
            tasks.start(Some("ghost-device"), "x").await,
            Err(TaskError::DeviceNotFound(_))
        ));
        assert!(matches!(
            tasks.start(None, "x").await,
            Err(TaskError::NotFound(_))
        ));
        assert_eq!(
            tasks.stop(None, "x").await.unwrap(),
            StopOutcome::NotRunning
        );
    }
}
