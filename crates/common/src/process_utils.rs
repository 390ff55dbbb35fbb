use chrono::{DateTime, Utc};
use std::ffi::OsStr;
use std::io;
use std::sync::{Mutex, MutexGuard};
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

#[cfg(windows)]
use windows_sys::Win32::Foundation::CloseHandle;
#[cfg(windows)]
use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

/// Point-in-time view of one OS process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub name: String,
    pub exe: Option<String>,
    pub cwd: Option<String>,
    pub cmdline: Vec<String>,
    /// Seconds since the Unix epoch.
    pub start_time: u64,
    pub cpu_percent: f32,
    pub memory_rss: u64,
    pub zombie: bool,
}

impl ProcessSnapshot {
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp(i64::try_from(self.start_time).ok()?, 0)
    }

    /// Upper bound for the real start: the OS truncates to whole seconds.
    pub fn started_no_later_than(&self) -> Option<DateTime<Utc>> {
        self.started_at().map(|at| at + chrono::Duration::seconds(1))
    }

    /// Whether `at` is a plausible start time for this process. Allows for
    /// the truncation above and for boot-time rounding in the process table.
    pub fn started_near(&self, at: DateTime<Utc>) -> bool {
        let Some(reported) = self.started_at() else {
            return false;
        };
        let offset = at - reported;
        offset >= chrono::Duration::seconds(-1) && offset < chrono::Duration::seconds(2)
    }

    pub fn is_alive(&self) -> bool {
        !self.zombie
    }

    fn from_process(pid: Pid, process: &Process) -> Self {
        Self {
            pid: pid.as_u32(),
            name: lossy(process.name()),
            exe: process.exe().map(|p| p.to_string_lossy().into_owned()),
            cwd: process.cwd().map(|p| p.to_string_lossy().into_owned()),
            cmdline: process.cmd().iter().map(lossy).collect(),
            start_time: process.start_time(),
            cpu_percent: process.cpu_usage(),
            memory_rss: process.memory(),
            zombie: process.status() == ProcessStatus::Zombie,
        }
    }
}

fn lossy<S: AsRef<OsStr> + ?Sized>(value: &S) -> String {
    value.as_ref().to_string_lossy().into_owned()
}

/// Shared handle on the OS process table.
///
/// Keeps one `sysinfo::System` alive so CPU usage is computed between
/// consecutive refreshes instead of always reading zero.
#[derive(Default)]
pub struct ProcessTable {
    system: Mutex<System>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refresh and return every visible process, oldest first.
    pub fn snapshot_all(&self) -> Vec<ProcessSnapshot> {
        let mut system = self.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::everything(),
        );
        let mut out: Vec<ProcessSnapshot> = system
            .processes()
            .iter()
            .filter(|(_, process)| process.thread_kind().is_none())
            .map(|(pid, process)| ProcessSnapshot::from_process(*pid, process))
            .collect();
        out.sort_by_key(|snapshot| (snapshot.start_time, snapshot.pid));
        out
    }

    /// Refresh a single pid. `None` when the process no longer exists or is not visible.
    pub fn inspect(&self, pid: u32) -> Option<ProcessSnapshot> {
        let target = Pid::from_u32(pid);
        let mut system = self.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::everything(),
        );
        system
            .process(target)
            .map(|process| ProcessSnapshot::from_process(target, process))
    }

    /// Alive and not a zombie.
    pub fn is_alive(&self, pid: u32) -> bool {
        self.inspect(pid).map(|p| p.is_alive()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Graceful request (SIGTERM).
    Terminate,
    /// Forced kill (SIGKILL / TerminateProcess).
    Kill,
}

/// Deliver `signal` to `pid`, or to its whole process group when `group` is set.
///
/// Returns `Ok(false)` when the target is already gone.
#[cfg(unix)]
pub fn send_signal(pid: u32, group: bool, signal: StopSignal) -> io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid as NixPid;

    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {pid} out of range")))?;
    let sig = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };
    let target = NixPid::from_raw(raw);
    let result = if group { killpg(target, sig) } else { kill(target, sig) };
    match result {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) if group => {
            // Leader may have left its group; fall back to the pid itself.
            match kill(target, sig) {
                Ok(()) => Ok(true),
                Err(Errno::ESRCH) => Ok(false),
                Err(err) => Err(io::Error::from(err)),
            }
        }
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(io::Error::from(err)),
    }
}

/// Windows has no graceful signal for arbitrary processes; both variants terminate.
#[cfg(windows)]
pub fn send_signal(pid: u32, _group: bool, _signal: StopSignal) -> io::Result<bool> {
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            let err = io::Error::last_os_error();
            // ERROR_INVALID_PARAMETER: no such pid.
            if err.raw_os_error() == Some(87) {
                return Ok(false);
            }
            return Err(err);
        }
        let ok = TerminateProcess(handle, 1);
        let err = if ok == 0 {
            Some(io::Error::last_os_error())
        } else {
            None
        };
        CloseHandle(handle);
        match err {
            Some(err) => Err(err),
            None => Ok(true),
        }
    }
}
