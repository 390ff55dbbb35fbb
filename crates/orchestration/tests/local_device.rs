#![cfg(unix)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use fleet_common::pid_map::{PidMap, SavedPid};
use fleet_common::process_utils::ProcessTable;
use fleet_common::{StartOutcome, StopOutcome, Task};
use fleet_orchestration::logs::backup_path;
use fleet_orchestration::{Device, LaunchSpec, LocalDevice, LocalDeviceConfig, SupervisorSettings};
use tempfile::TempDir;

fn device(dir: &TempDir) -> LocalDevice {
    LocalDevice::new(
        LocalDeviceConfig {
            id: "it-device".into(),
            name: "it".into(),
            data_dir: dir.path().to_path_buf(),
            python_exec: None,
            settings: SupervisorSettings {
                stop_grace_ms: 500,
                ..SupervisorSettings::default()
            },
        },
        None,
    )
}

fn task(id: &str, command: &str, timeout: Option<u64>) -> Task {
    Task {
        id: id.into(),
        name: id.into(),
        command: command.into(),
        cwd: None,
        env: HashMap::new(),
        description: None,
        device_id: "it-device".into(),
        schedule: None,
        timeout,
        order: 0,
        created_at: Utc::now(),
    }
}

async fn wait_until_stopped(device: &LocalDevice, task: &Task, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        device.scan(std::slice::from_ref(task)).await;
        if !device.task_status(&task.id).await.running {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Sleep until the wall clock is late in its current second, where
/// whole-second start times are furthest from the truth.
async fn align_to_late_subsecond() {
    while Utc::now().timestamp_subsec_millis() < 850 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn processes_running(args: &[&str]) -> usize {
    ProcessTable::new()
        .snapshot_all()
        .iter()
        .filter(|process| process.is_alive() && process.cmdline == args)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_starts_spawn_one_process() {
    let dir = TempDir::new().unwrap();
    let device = device(&dir);
    let spec = LaunchSpec::from(&task("twin", "sleep 41.01", None));

    let (a, b) = tokio::join!(device.start_task(&spec), device.start_task(&spec));
    let pids = [a.pid().unwrap(), b.pid().unwrap()];
    assert_eq!(pids[0], pids[1]);
    let started = [&a, &b]
        .iter()
        .filter(|outcome| matches!(outcome, StartOutcome::Started { .. }))
        .count();
    assert_eq!(started, 1);

    assert!(matches!(
        device.stop_task("twin").await,
        StopOutcome::Stopped { .. }
    ));
}

#[tokio::test]
async fn out_of_band_kill_is_noticed() {
    let dir = TempDir::new().unwrap();
    let device = device(&dir);
    let task = task("victim", "sleep 41.02", None);

    let pid = device
        .start_task(&LaunchSpec::from(&task))
        .await
        .pid()
        .unwrap();
    assert!(device.task_status("victim").await.running);

    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    assert!(wait_until_stopped(&device, &task, Duration::from_secs(5)).await);
    let status = device.task_status("victim").await;
    assert_eq!(status.pid, None);
    assert!(status.finished_at.is_some());
}

#[tokio::test]
async fn manually_started_process_is_adopted() {
    let dir = TempDir::new().unwrap();
    let device = device(&dir);
    let task = task("stray", "sleep 41.03", None);

    let mut manual = std::process::Command::new("sleep")
        .arg("41.03")
        .spawn()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    device.scan(std::slice::from_ref(&task)).await;
    let status = device.task_status("stray").await;
    assert!(status.running);
    assert_eq!(status.pid, Some(manual.id()));

    let again = device.start_task(&LaunchSpec::from(&task)).await;
    assert_eq!(again, StartOutcome::AlreadyRunning { pid: manual.id() });

    manual.kill().unwrap();
    manual.wait().unwrap();
}

#[tokio::test]
async fn timeout_stops_task() {
    let dir = TempDir::new().unwrap();
    let device = device(&dir);
    let task = task("slow", "sleep 41.04", Some(2));
    let begun = Instant::now();

    device.start_task(&LaunchSpec::from(&task)).await;
    assert!(wait_until_stopped(&device, &task, Duration::from_secs(8)).await);
    let elapsed = begun.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "stopped too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "stopped too late: {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_survives_supervisor_restart() {
    let dir = TempDir::new().unwrap();
    let task = task("restart", "sleep 41.05", Some(3));
    align_to_late_subsecond().await;
    let begun = Instant::now();

    let first = device(&dir);
    let pid = first
        .start_task(&LaunchSpec::from(&task))
        .await
        .pid()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    drop(first);

    let second = device(&dir);
    second.scan(std::slice::from_ref(&task)).await;
    assert_eq!(second.task_status("restart").await.pid, Some(pid));
    second.restore_timeouts(std::slice::from_ref(&task)).await;

    assert!(wait_until_stopped(&second, &task, Duration::from_secs(8)).await);
    // The deadline counts from the process start, not from the restart,
    // and never falls short of the full budget.
    let elapsed = begun.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "stopped too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(4_000), "stopped too late: {elapsed:?}");
}

#[tokio::test]
async fn adopted_process_gets_at_least_its_full_budget() {
    let dir = TempDir::new().unwrap();
    let device = device(&dir);
    let task = task("found", "sleep 41.11", Some(2));

    align_to_late_subsecond().await;
    let begun = Instant::now();
    let mut manual = std::process::Command::new("sleep")
        .arg("41.11")
        .spawn()
        .unwrap();

    let outcome = device.start_task(&LaunchSpec::from(&task)).await;
    assert_eq!(outcome, StartOutcome::AlreadyRunning { pid: manual.id() });
    // Only the OS start time is known here; the watchdog must not undercut it.
    assert!(wait_until_stopped(&device, &task, Duration::from_secs(8)).await);
    let elapsed = begun.elapsed();
    assert!(elapsed >= Duration::from_secs(2), "stopped too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(4_500), "stopped too late: {elapsed:?}");
    let _ = manual.wait();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_racing_scan_binds_the_existing_process() {
    let dir = TempDir::new().unwrap();
    let device = device(&dir);
    let task = task("contested", "sleep 41.06", None);
    let mut manual = std::process::Command::new("sleep")
        .arg("41.06")
        .spawn()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let spec = LaunchSpec::from(&task);
    let (started, ()) = tokio::join!(
        device.start_task(&spec),
        device.scan(std::slice::from_ref(&task))
    );
    assert_eq!(started, StartOutcome::AlreadyRunning { pid: manual.id() });
    assert_eq!(device.task_status("contested").await.pid, Some(manual.id()));
    assert_eq!(processes_running(&["sleep", "41.06"]), 1);

    manual.kill().unwrap();
    manual.wait().unwrap();
}

#[tokio::test]
async fn saved_pid_running_another_command_is_discarded() {
    let dir = TempDir::new().unwrap();
    let mut unrelated = std::process::Command::new("sleep")
        .arg("41.07")
        .spawn()
        .unwrap();
    let pid_path = dir.path().join("pids.json");
    let mut saved = PidMap::new();
    saved.insert("ghost", SavedPid::new(unrelated.id(), Some(Utc::now())));
    saved.save(&pid_path).unwrap();

    let device = device(&dir);
    let task = task("ghost", "sleep 41.08", None);
    device.scan(std::slice::from_ref(&task)).await;

    let status = device.task_status("ghost").await;
    assert!(!status.running);
    assert_eq!(status.pid, None);
    assert!(PidMap::load(&pid_path).get("ghost").is_none());

    unrelated.kill().unwrap();
    unrelated.wait().unwrap();
}

#[tokio::test]
async fn related_processes_are_scored_against_the_command() {
    let dir = TempDir::new().unwrap();
    let device = device(&dir);
    let mut manual = std::process::Command::new("sleep")
        .arg("41.09")
        .spawn()
        .unwrap();
    let pid = manual.id();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let score_for = |related: Vec<fleet_common::RelatedProcess>| {
        related.into_iter().find(|p| p.pid == pid).map(|p| p.score)
    };
    assert_eq!(score_for(device.find_related("t", "sleep 41.09").await), Some(3));
    assert_eq!(score_for(device.find_related("t", "sleep").await), Some(2));
    assert_eq!(score_for(device.find_related("t", "sleep 7").await), Some(1));
    // A directory-qualified executable elsewhere does not match by name alone.
    assert_eq!(
        score_for(device.find_related("t", "/nonexistent/bin/sleep 7").await),
        None
    );

    let related = device.find_related("t", "sleep 41.09").await;
    let entry = related.iter().find(|p| p.pid == pid).unwrap();
    assert_eq!(entry.cmd_args, "41.09");
    assert!(entry.started_at.is_some());

    manual.kill().unwrap();
    manual.wait().unwrap();
}

#[tokio::test]
async fn stopping_unknown_task_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let device = device(&dir);
    assert_eq!(device.stop_task("never-started").await, StopOutcome::NotRunning);
    assert_eq!(device.stop_task("never-started").await, StopOutcome::NotRunning);
}

#[tokio::test]
async fn oversized_log_is_rotated_before_next_run() {
    let dir = TempDir::new().unwrap();
    let device = device(&dir);
    let task = task("chatty", "echo fresh-run-output", None);
    let log = device.log_path("chatty");
    std::fs::create_dir_all(log.parent().unwrap()).unwrap();
    std::fs::write(backup_path(&log), b"older generation").unwrap();
    std::fs::write(&log, vec![b'x'; 10 * 1024 * 1024 + 1]).unwrap();

    device.start_task(&LaunchSpec::from(&task)).await;

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut current = String::new();
    while Instant::now() < deadline {
        current = std::fs::read_to_string(&log).unwrap_or_default();
        if current.contains("fresh-run-output") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(current.contains("--- Starting task at"));
    assert!(current.contains("fresh-run-output"));
    assert!(!current.contains("xxxx"));

    let backup = std::fs::metadata(backup_path(&log)).unwrap();
    assert_eq!(backup.len(), 10 * 1024 * 1024 + 1);

    let tail = device.logs("chatty", 10).await;
    assert!(tail.iter().any(|line| line.contains("fresh-run-output")));
}
