#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use fleet_common::{AssociateOutcome, NewTask};
use fleet_orchestration::{
    DeviceManager, EventHub, FleetSettings, SupervisorSettings, TaskError, TaskManager,
};
use tempfile::TempDir;

fn manager(dir: &TempDir) -> TaskManager {
    let devices = DeviceManager::open(
        dir.path(),
        SupervisorSettings::default(),
        FleetSettings::default(),
        None,
    )
    .unwrap();
    let (tasks, _fired) = TaskManager::new(Arc::new(devices), Arc::new(EventHub::new()));
    tasks
}

#[tokio::test]
async fn associating_a_process_backfills_command_and_cwd() {
    let dir = TempDir::new().unwrap();
    let workdir = TempDir::new().unwrap();
    let tasks = manager(&dir);
    let created = tasks
        .create(NewTask {
            name: "adopt-me".into(),
            command: "placeholder".into(),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let mut manual = std::process::Command::new("sleep")
        .arg("41.10")
        .current_dir(workdir.path())
        .spawn()
        .unwrap();
    let pid = manual.id();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = tasks.associate(None, &created.id, pid).await.unwrap();
    assert!(matches!(outcome, AssociateOutcome::Associated { pid: bound, .. } if bound == pid));

    let view = tasks.get(None, &created.id).await.unwrap();
    assert_eq!(view.task.command, "sleep 41.10");
    let expected = workdir.path().canonicalize().unwrap();
    assert_eq!(view.task.cwd.as_deref(), Some(expected.to_str().unwrap()));
    assert!(view.status.running);
    assert_eq!(view.status.pid, Some(pid));

    manual.kill().unwrap();
    manual.wait().unwrap();
}

#[tokio::test]
async fn failed_association_leaves_the_definition_alone() {
    let dir = TempDir::new().unwrap();
    let tasks = manager(&dir);
    let created = tasks
        .create(NewTask {
            name: "keep".into(),
            command: "echo keep".into(),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let outcome = tasks.associate(None, &created.id, 999_999).await.unwrap();
    assert!(matches!(outcome, AssociateOutcome::Error { .. }));
    assert_eq!(tasks.get(None, &created.id).await.unwrap().task.command, "echo keep");

    assert!(matches!(
        tasks.associate(None, "missing", std::process::id()).await,
        Err(TaskError::NotFound(_))
    ));
}
