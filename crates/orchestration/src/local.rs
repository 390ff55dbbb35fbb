use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use fleet_common::command::{is_unqualified_python, matches_tokens, resolve_argv};
use fleet_common::pid_map::PidMap;
use fleet_common::process_utils::{send_signal, ProcessSnapshot, ProcessTable, StopSignal};
use fleet_common::related::{rank_related, RelatedTarget};
use fleet_common::spawn_error::classify_spawn_error;
use fleet_common::{
    AssociateOutcome, DeviceInfo, DeviceKind, KillOutcome, MatchRequestItem, RelatedProcess,
    StartOutcome, StopOutcome, Task, TaskStatus,
};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::DeviceError;
use crate::logs::{self, RunHeader};
use crate::registry::{ProcessRegistry, TrackedProcess};
use crate::types::{
    LaunchSpec, LogLine, SupervisorSettings, LOG_CHANNEL_CAPACITY, PYTHON_EXEC_ENV,
    STOP_POLL_INTERVAL,
};
use crate::watchdog::{self, Budget};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Settings needed to bring up the supervisor for this machine.
#[derive(Debug, Clone)]
pub struct LocalDeviceConfig {
    pub id: String,
    pub name: String,
    pub data_dir: PathBuf,
    pub python_exec: Option<String>,
    pub settings: SupervisorSettings,
}

#[derive(Debug, Clone)]
struct Profile {
    name: String,
    python_exec: Option<String>,
}

/// Process supervisor for the machine this daemon runs on.
#[derive(Clone)]
pub struct LocalDevice {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    id: String,
    profile: RwLock<Profile>,
    log_dir: PathBuf,
    pid_path: PathBuf,
    settings: SupervisorSettings,
    registry: Mutex<ProcessRegistry>,
    table: ProcessTable,
    /// Serialises start/stop/adoption per task so concurrent starts yield one process.
    gates: Mutex<GateMap>,
    persist_gate: AsyncMutex<()>,
    last_deep_scan: Mutex<Option<Instant>>,
    log_sink: Option<mpsc::Sender<LogLine>>,
}

type GateMap = HashMap<String, Arc<AsyncMutex<()>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive hold on one task id. Map entries nobody holds or waits on are
/// pruned when a hold ends.
struct TaskGate<'a> {
    gates: &'a Mutex<GateMap>,
    gate: Option<Arc<AsyncMutex<()>>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for TaskGate<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        drop(self.gate.take());
        lock(self.gates).retain(|_, gate| Arc::strong_count(gate) > 1);
    }
}

impl LocalDevice {
    pub fn new(config: LocalDeviceConfig, log_sink: Option<mpsc::Sender<LogLine>>) -> Self {
        let pid_path = config.data_dir.join("pids.json");
        let saved = PidMap::load(&pid_path);
        if !saved.is_empty() {
            debug!(entries = saved.len(), "loaded durable pid map");
        }
        Self {
            inner: Arc::new(LocalInner {
                log_dir: logs::log_dir(&config.data_dir, &config.id),
                id: config.id,
                profile: RwLock::new(Profile {
                    name: config.name,
                    python_exec: config.python_exec,
                }),
                pid_path,
                settings: config.settings,
                registry: Mutex::new(ProcessRegistry::new(saved)),
                table: ProcessTable::new(),
                gates: Mutex::new(HashMap::new()),
                persist_gate: AsyncMutex::new(()),
                last_deep_scan: Mutex::new(None),
                log_sink,
            }),
        }
    }

    pub fn log_path(&self, task_id: &str) -> PathBuf {
        logs::log_path(&self.inner.log_dir, task_id)
    }

    pub fn name(&self) -> String {
        self.inner.profile().name
    }

    pub fn python_exec(&self) -> Option<String> {
        self.inner.profile().python_exec
    }

    pub fn set_name(&self, name: &str) {
        if let Ok(mut profile) = self.inner.profile.write() {
            profile.name = name.to_string();
        }
    }

    pub fn set_python_exec(&self, python_exec: Option<String>) {
        if let Ok(mut profile) = self.inner.profile.write() {
            profile.python_exec = python_exec;
        }
    }

    /// Arm watchdogs for running tasks that have none, using the remaining
    /// budget computed from each process's start time. Overdue tasks are stopped.
    pub async fn restore_timeouts(&self, tasks: &[Task]) {
        for task in tasks {
            let Some(secs) = task.timeout_secs() else { continue };
            let (pid, origin, armed) = {
                let registry = self.inner.registry();
                match registry.live(&task.id) {
                    Some(tracked) => (tracked.pid, tracked.timeout_origin(), tracked.has_watchdog()),
                    None => continue,
                }
            };
            if armed {
                continue;
            }
            let origin = match origin {
                Some(at) => Some(at),
                None => self
                    .inner
                    .inspect(pid)
                    .await
                    .and_then(|p| p.started_no_later_than()),
            };
            self.inner
                .enforce_timeout(&task.id, pid, origin, std::time::Duration::from_secs(secs));
        }
    }

    /// One process-table snapshot; each entry gets the first unclaimed match.
    pub async fn match_processes(&self, items: &[MatchRequestItem]) -> HashMap<String, TaskStatus> {
        let snapshot = self.inner.snapshot_all().await;
        let own_pid = std::process::id();
        let mut claimed = HashSet::new();
        let mut out = HashMap::new();
        for item in items {
            let target = resolve_argv(&item.command);
            let found = snapshot.iter().find(|candidate| {
                candidate.pid != own_pid
                    && candidate.is_alive()
                    && !claimed.contains(&candidate.pid)
                    && matches_tokens(&target, &candidate.cmdline)
            });
            let status = match found {
                Some(process) => {
                    claimed.insert(process.pid);
                    running_status(&item.id, process, None)
                }
                None => TaskStatus::idle(item.id.clone()),
            };
            out.insert(item.id.clone(), status);
        }
        out
    }
}

fn running_status(
    task_id: &str,
    process: &ProcessSnapshot,
    started_at: Option<chrono::DateTime<Utc>>,
) -> TaskStatus {
    TaskStatus {
        id: task_id.to_string(),
        running: true,
        pid: Some(process.pid),
        started_at: started_at.or_else(|| process.started_at()),
        finished_at: None,
        cpu_percent: Some(process.cpu_percent),
        memory_rss: Some(process.memory_rss),
        message: None,
    }
}

impl LocalInner {
    fn registry(&self) -> MutexGuard<'_, ProcessRegistry> {
        lock(&self.registry)
    }

    fn profile(&self) -> Profile {
        self.profile
            .read()
            .map(|profile| profile.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    async fn enter(&self, task_id: &str) -> TaskGate<'_> {
        let gate = lock(&self.gates)
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let mut hold = TaskGate {
            gates: &self.gates,
            gate: Some(Arc::clone(&gate)),
            held: None,
        };
        hold.held = Some(gate.lock_owned().await);
        hold
    }

    fn python_override(&self) -> Option<String> {
        self.profile()
            .python_exec
            .filter(|exec| !exec.trim().is_empty())
            .or_else(|| std::env::var(PYTHON_EXEC_ENV).ok().filter(|v| !v.trim().is_empty()))
    }

    async fn snapshot_all(self: &Arc<Self>) -> Vec<ProcessSnapshot> {
        let inner = Arc::clone(self);
        tokio::task::spawn_blocking(move || inner.table.snapshot_all())
            .await
            .unwrap_or_default()
    }

    async fn inspect(self: &Arc<Self>, pid: u32) -> Option<ProcessSnapshot> {
        let inner = Arc::clone(self);
        tokio::task::spawn_blocking(move || inner.table.inspect(pid))
            .await
            .unwrap_or(None)
    }

    async fn is_alive(self: &Arc<Self>, pid: u32) -> bool {
        self.inspect(pid).await.map(|p| p.is_alive()).unwrap_or(false)
    }

    /// Write the durable pid map. The snapshot is taken under the persist
    /// gate so that saves land in order.
    async fn persist_pids(&self) {
        let _gate = self.persist_gate.lock().await;
        let snapshot = self.registry().saved_snapshot();
        let path = self.pid_path.clone();
        match tokio::task::spawn_blocking(move || snapshot.save(&path)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to persist pid map"),
            Err(err) => warn!(error = %err, "pid map writer panicked"),
        }
    }

    async fn finish(&self, task_id: &str, pid: Option<u32>) -> bool {
        let (was_live, saved_changed) = self.registry().mark_finished(task_id, pid, Utc::now());
        if saved_changed {
            self.persist_pids().await;
        }
        was_live
    }

    fn prepare_argv(&self, mut argv: Vec<String>, raw: &str) -> Vec<String> {
        if is_unqualified_python(&argv[0]) {
            if let Some(exec) = self.python_override() {
                argv[0] = exec;
            }
        }
        let first = argv[0].to_ascii_lowercase();
        if first.ends_with(".ps1") {
            let mut wrapped = vec![powershell_exe(), "-File".to_string()];
            wrapped.extend(argv);
            return wrapped;
        }
        if cfg!(windows) && first.ends_with(".vbs") {
            let mut wrapped = vec!["cscript".to_string(), "//Nologo".to_string()];
            wrapped.extend(argv);
            return wrapped;
        }
        if cfg!(windows) && argv[0] == "." {
            return vec![powershell_exe(), "-Command".to_string(), raw.to_string()];
        }
        argv
    }

    async fn spawn(self: &Arc<Self>, spec: &LaunchSpec) -> Result<u32, DeviceError> {
        let argv = resolve_argv(&spec.command);
        if argv.is_empty() {
            return Err(DeviceError::EmptyCommand);
        }
        let argv = self.prepare_argv(argv, &spec.command);
        let task_id = spec.task_id.as_str();

        let log_path = logs::log_path(&self.log_dir, task_id);
        if let Err(err) = logs::prepare(&log_path, self.settings.log_rotate_bytes).await {
            warn!(%task_id, error = %err, "log rotation failed");
        }

        let cwd = spec
            .cwd
            .clone()
            .filter(|dir| !dir.is_empty() && Path::new(dir).is_dir());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(&spec.env)
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONUTF8", "1")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                // Lead a new process group so stop can signal the whole tree.
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd
            .spawn()
            .map_err(|err| DeviceError::Spawn(classify_spawn_error(err, &argv)))?;
        let pid = child.id().ok_or(DeviceError::NoPid)?;
        let started_at = Utc::now();

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            logs::spawn_pump(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            logs::spawn_pump(stderr, tx.clone());
        }
        drop(tx);
        tokio::spawn(logs::run_writer(
            task_id.to_string(),
            log_path,
            RunHeader {
                argv: argv.clone(),
                cwd: cwd.clone(),
            },
            rx,
            self.log_sink.clone(),
        ));

        if self
            .registry()
            .track(task_id, TrackedProcess::spawned(pid, started_at))
        {
            self.persist_pids().await;
        }

        tokio::spawn(supervise(Arc::downgrade(self), task_id.to_string(), pid, child));

        if let Some(timeout) = spec.timeout() {
            self.enforce_timeout(task_id, pid, Some(started_at), timeout);
        }

        info!(%task_id, pid, argv = ?argv, cwd = ?cwd, "task spawned");
        Ok(pid)
    }

    /// Arm a watchdog for the budget left since `origin`, or stop right away
    /// when overdue.
    fn enforce_timeout(
        self: &Arc<Self>,
        task_id: &str,
        pid: u32,
        origin: Option<chrono::DateTime<Utc>>,
        timeout: std::time::Duration,
    ) {
        let budget = match origin {
            Some(at) => watchdog::remaining_budget(at, timeout, Utc::now()),
            None => Budget::Remaining(timeout),
        };
        let weak = Arc::downgrade(self);
        let owned_id = task_id.to_string();
        let expire = move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.expire(&owned_id, pid).await;
            }
        };
        match budget {
            Budget::Remaining(left) => {
                debug!(%task_id, pid, remaining_ms = left.as_millis() as u64, "watchdog armed");
                let handle = watchdog::arm(task_id.to_string(), pid, left, expire);
                self.registry().set_watchdog(task_id, pid, handle);
            }
            Budget::Overdue(by) => {
                warn!(%task_id, pid, overdue_secs = by.as_secs_f64(), "task overdue, stopping now");
                tokio::spawn(expire());
            }
        }
    }

    /// Timeout expiry: stop only if the task still runs the same process.
    async fn expire(self: &Arc<Self>, task_id: &str, pid: u32) {
        if self.registry().live_pid(task_id) != Some(pid) {
            return;
        }
        let outcome = self.stop(task_id).await;
        info!(%task_id, pid, ?outcome, "timeout stop finished");
    }

    async fn start(self: &Arc<Self>, spec: &LaunchSpec) -> StartOutcome {
        let task_id = spec.task_id.as_str();
        let _gate = self.enter(task_id).await;

        let live = self.registry().live_pid(task_id);
        if let Some(pid) = live {
            if self.is_alive(pid).await {
                return StartOutcome::AlreadyRunning { pid };
            }
            self.finish(task_id, Some(pid)).await;
        }

        let target = resolve_argv(&spec.command);
        if !target.is_empty() {
            let claimed = self.registry().claimed_pids();
            let snapshot = self.snapshot_all().await;
            if let Some(found) = first_match(&target, &snapshot, &claimed) {
                let pid = found.pid;
                self.adopt(task_id, found, None, spec.timeout()).await;
                info!(%task_id, pid, "start found a live matching process");
                return StartOutcome::AlreadyRunning { pid };
            }
        }

        match self.spawn(spec).await {
            Ok(pid) => StartOutcome::Started { pid },
            Err(err) => {
                warn!(%task_id, error = %err, "task failed to start");
                StartOutcome::Error {
                    message: err.to_string(),
                }
            }
        }
    }

    /// Bind a running process to the task. The caller holds the task gate.
    /// `recorded_start` is the spawn-time start saved in the pid map; it is
    /// used when it agrees with what the OS reports for the process.
    async fn adopt(
        self: &Arc<Self>,
        task_id: &str,
        process: &ProcessSnapshot,
        recorded_start: Option<chrono::DateTime<Utc>>,
        timeout: Option<std::time::Duration>,
    ) {
        let tracked = match recorded_start.filter(|at| process.started_near(*at)) {
            Some(at) => TrackedProcess::restored(process.pid, at),
            None => TrackedProcess::adopted(process.pid, process.started_at()),
        };
        let origin = tracked.timeout_origin();
        if self.registry().track(task_id, tracked) {
            self.persist_pids().await;
        }
        info!(%task_id, pid = process.pid, "adopted running process");
        if let Some(timeout) = timeout {
            self.enforce_timeout(task_id, process.pid, origin, timeout);
        }
    }

    /// Adopt from a scan. Skipped when the task or the process got bound
    /// after the scan looked.
    async fn adopt_unbound(
        self: &Arc<Self>,
        task_id: &str,
        process: &ProcessSnapshot,
        recorded_start: Option<chrono::DateTime<Utc>>,
    ) -> bool {
        let _gate = self.enter(task_id).await;
        {
            let registry = self.registry();
            if registry.live_pid(task_id).is_some() || registry.owner_of(process.pid).is_some() {
                return false;
            }
        }
        self.adopt(task_id, process, recorded_start, None).await;
        true
    }

    async fn stop(self: &Arc<Self>, task_id: &str) -> StopOutcome {
        let _gate = self.enter(task_id).await;

        let tracked = self
            .registry()
            .live(task_id)
            .map(|tracked| (tracked.pid, tracked.owned));
        let Some((pid, owned)) = tracked else {
            if self.registry().forget_saved(task_id) {
                self.persist_pids().await;
            }
            return StopOutcome::NotRunning;
        };

        match self.terminate(pid, owned).await {
            Ok(true) => {
                self.finish(task_id, Some(pid)).await;
                info!(%task_id, pid, "task stopped");
                StopOutcome::Stopped { message: None }
            }
            Ok(false) => {
                self.finish(task_id, Some(pid)).await;
                StopOutcome::Stopped {
                    message: Some("Process already gone".to_string()),
                }
            }
            Err(err) => {
                warn!(%task_id, pid, error = %err, "failed to stop task");
                StopOutcome::Error {
                    message: err.to_string(),
                }
            }
        }
    }

    /// Graceful terminate, poll for the grace period, then kill.
    /// `Ok(false)` means the process was already gone.
    async fn terminate(self: &Arc<Self>, pid: u32, group: bool) -> std::io::Result<bool> {
        match send_signal(pid, group, StopSignal::Terminate) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(err) => {
                if !self.is_alive(pid).await {
                    return Ok(false);
                }
                return Err(err);
            }
        }

        let deadline = tokio::time::Instant::now() + self.settings.stop_grace();
        loop {
            if !self.is_alive(pid).await {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        warn!(pid, "process ignored terminate, killing");
        if !send_signal(pid, group, StopSignal::Kill)? {
            return Ok(true);
        }
        for _ in 0..10 {
            if !self.is_alive(pid).await {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        Ok(true)
    }

    async fn status(self: &Arc<Self>, task_id: &str) -> TaskStatus {
        let tracked = self
            .registry()
            .live(task_id)
            .map(|tracked| (tracked.pid, tracked.started_at));
        if let Some((pid, started_at)) = tracked {
            match self.inspect(pid).await {
                Some(process) if process.is_alive() => {
                    return running_status(task_id, &process, started_at);
                }
                _ => {
                    self.finish(task_id, Some(pid)).await;
                }
            }
        }
        let mut status = TaskStatus::idle(task_id);
        if let Some(run) = self.registry().history(task_id) {
            status.started_at = run.started_at;
            status.finished_at = Some(run.finished_at);
        }
        status
    }

    fn deep_scan_due(&self) -> bool {
        let interval = self.settings.deep_scan_min_interval();
        let mut last = lock(&self.last_deep_scan);
        let due = match *last {
            Some(at) => interval.is_zero() || at.elapsed() >= interval,
            None => true,
        };
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    async fn scan(self: &Arc<Self>, tasks: &[Task]) {
        // Liveness sweep.
        let tracked = self.registry().tracked();
        for (task_id, pid) in tracked {
            if !self.is_alive(pid).await && self.finish(&task_id, Some(pid)).await {
                info!(%task_id, pid, "tracked process is gone");
            }
        }

        // Saved-pid restoration.
        let mut unresolved = Vec::new();
        for task in tasks {
            let (live, saved) = {
                let registry = self.registry();
                (registry.live_pid(&task.id), registry.saved_pid(&task.id))
            };
            if live.is_some() {
                continue;
            }
            let Some(saved) = saved else {
                unresolved.push(task);
                continue;
            };
            let pid = saved.pid;
            let target = resolve_argv(&task.command);
            let claimed = self.registry().claimed_pids();
            match self.inspect(pid).await {
                Some(process)
                    if process.is_alive()
                        && !claimed.contains(&pid)
                        && matches_tokens(&target, &process.cmdline) =>
                {
                    self.adopt_unbound(&task.id, &process, saved.started_at).await;
                }
                _ => {
                    debug!(task_id = %task.id, pid, "discarding stale saved pid");
                    let forgotten = {
                        let mut registry = self.registry();
                        // A start may have rebound the task since the hint was read.
                        registry.saved_pid(&task.id) == Some(saved) && registry.forget_saved(&task.id)
                    };
                    if forgotten {
                        self.persist_pids().await;
                    }
                    unresolved.push(task);
                }
            }
        }

        // Deep re-association.
        if unresolved.is_empty() || !self.deep_scan_due() {
            return;
        }
        let snapshot = self.snapshot_all().await;
        let mut claimed = self.registry().claimed_pids();
        for task in unresolved {
            let target = resolve_argv(&task.command);
            if target.is_empty() {
                continue;
            }
            if let Some(found) = first_match(&target, &snapshot, &claimed) {
                if self.adopt_unbound(&task.id, found, None).await {
                    claimed.insert(found.pid);
                }
            }
        }
    }

    async fn related(self: &Arc<Self>, command: &str) -> Vec<RelatedProcess> {
        let python = self.python_override();
        let Some(target) = RelatedTarget::new(command, python.as_deref()) else {
            return Vec::new();
        };
        let own_pid = std::process::id();
        let snapshot: Vec<ProcessSnapshot> = self
            .snapshot_all()
            .await
            .into_iter()
            .filter(|process| process.pid != own_pid)
            .collect();
        rank_related(&target, &snapshot)
    }

    async fn kill(self: &Arc<Self>, pid: u32) -> KillOutcome {
        if pid == std::process::id() {
            return KillOutcome::Error {
                message: "refusing to kill the agent process".to_string(),
            };
        }
        match self.terminate(pid, false).await {
            Ok(_) => {
                let owner = self.registry().owner_of(pid).map(str::to_string);
                if let Some(task_id) = owner {
                    self.finish(&task_id, Some(pid)).await;
                }
                info!(pid, "process killed on request");
                KillOutcome::Killed
            }
            Err(err) => KillOutcome::Error {
                message: err.to_string(),
            },
        }
    }

    async fn associate(self: &Arc<Self>, task_id: &str, pid: u32) -> AssociateOutcome {
        let Some(process) = self.inspect(pid).await.filter(|p| p.is_alive()) else {
            return AssociateOutcome::Error {
                message: "Process not found".to_string(),
            };
        };
        let _gate = self.enter(task_id).await;
        let owner = self.registry().owner_of(pid).map(str::to_string);
        if let Some(owner) = owner.filter(|owner| owner != task_id) {
            return AssociateOutcome::Error {
                message: format!("Process {pid} is already bound to task {owner}"),
            };
        }
        self.adopt(task_id, &process, None, None).await;
        AssociateOutcome::Associated {
            pid,
            started_at: process.started_at(),
            cmdline: process.cmdline.clone(),
            cwd: process.cwd.clone(),
        }
    }
}

fn first_match<'a>(
    target: &[String],
    snapshot: &'a [ProcessSnapshot],
    claimed: &HashSet<u32>,
) -> Option<&'a ProcessSnapshot> {
    let own_pid = std::process::id();
    snapshot.iter().find(|process| {
        process.pid != own_pid
            && process.is_alive()
            && !claimed.contains(&process.pid)
            && matches_tokens(target, &process.cmdline)
    })
}

fn powershell_exe() -> String {
    if which::which("pwsh").is_ok() {
        "pwsh".to_string()
    } else {
        "powershell".to_string()
    }
}

/// Owns the child handle for one run and records its exit.
async fn supervise(inner: Weak<LocalInner>, task_id: String, pid: u32, mut child: Child) {
    let status = child.wait().await;
    match &status {
        Ok(status) => info!(%task_id, pid, %status, "task exited"),
        Err(err) => warn!(%task_id, pid, error = %err, "lost track of child"),
    }
    if let Some(inner) = inner.upgrade() {
        inner.finish(&task_id, Some(pid)).await;
    }
}

#[async_trait]
impl Device for LocalDevice {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn info(&self) -> DeviceInfo {
        let profile = self.inner.profile();
        DeviceInfo {
            id: self.inner.id.clone(),
            name: profile.name,
            kind: DeviceKind::Local,
            url: None,
            python_exec: profile.python_exec,
        }
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Local
    }

    async fn start_task(&self, spec: &LaunchSpec) -> StartOutcome {
        self.inner.start(spec).await
    }

    async fn stop_task(&self, task_id: &str) -> StopOutcome {
        self.inner.stop(task_id).await
    }

    async fn task_status(&self, task_id: &str) -> TaskStatus {
        self.inner.status(task_id).await
    }

    async fn scan(&self, tasks: &[Task]) {
        self.inner.scan(tasks).await
    }

    async fn logs(&self, task_id: &str, lines: usize) -> Vec<String> {
        match logs::tail(&self.log_path(task_id), lines).await {
            Ok(lines) => lines,
            Err(err) => {
                warn!(%task_id, error = %err, "failed to read task log");
                Vec::new()
            }
        }
    }

    async fn find_related(&self, _task_id: &str, command: &str) -> Vec<RelatedProcess> {
        self.inner.related(command).await
    }

    async fn kill_process(&self, pid: u32) -> KillOutcome {
        self.inner.kill(pid).await
    }

    async fn associate(&self, task_id: &str, pid: u32) -> AssociateOutcome {
        self.inner.associate(task_id, pid).await
    }
}
