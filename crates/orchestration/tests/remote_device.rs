use std::time::{Duration, Instant};

use fleet_common::{KillOutcome, StartOutcome, StopOutcome};
use fleet_orchestration::{
    Device, LaunchSpec, LocalDevice, LocalDeviceConfig, PeerRecord, RemoteDevice,
    SupervisorSettings,
};
use tempfile::TempDir;

fn unreachable() -> RemoteDevice {
    RemoteDevice::new(
        PeerRecord {
            id: "offline-peer".into(),
            name: "offline".into(),
            url: "http://127.0.0.1:9".into(),
            token: "token".into(),
            python_exec: None,
        },
        reqwest::Client::new(),
        Duration::from_secs(2),
    )
}

#[tokio::test]
async fn unreachable_peer_does_not_hold_up_other_devices() {
    let dir = TempDir::new().unwrap();
    let local = LocalDevice::new(
        LocalDeviceConfig {
            id: "local".into(),
            name: "local".into(),
            data_dir: dir.path().to_path_buf(),
            python_exec: None,
            settings: SupervisorSettings::default(),
        },
        None,
    );
    let remote = unreachable();
    let devices: Vec<Box<dyn Device>> = vec![Box::new(remote), Box::new(local)];

    let begun = Instant::now();
    let outcomes =
        futures_util::future::join_all(devices.iter().map(|device| device.stop_task("t"))).await;
    assert!(begun.elapsed() < Duration::from_secs(5));

    assert!(matches!(outcomes[0], StopOutcome::Error { .. }));
    assert_eq!(outcomes[1], StopOutcome::NotRunning);
}

#[tokio::test]
async fn every_proxy_call_degrades_to_a_value() {
    let remote = unreachable();
    assert!(matches!(
        remote.start_task(&LaunchSpec::by_id("t")).await,
        StartOutcome::Error { .. }
    ));
    assert!(matches!(remote.kill_process(1).await, KillOutcome::Error { .. }));
    assert!(remote.logs("t", 10).await.is_empty());
    assert!(remote.find_related("t", "").await.is_empty());

    let status = remote.task_status("t").await;
    assert!(!status.running);
    assert!(status.message.is_some());
}
