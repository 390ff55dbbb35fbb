use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header::AUTHORIZATION, Method, Request, StatusCode};
use axum::Router;
use fleet_common::{NewTask, StopOutcome};
use fleet_orchestration::{DeviceManager, EventHub, FleetSettings, SupervisorSettings, TaskManager};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tower::ServiceExt;

struct Agent {
    _dir: TempDir,
    tasks: Arc<TaskManager>,
    token: String,
}

impl Agent {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let devices = DeviceManager::open(
            dir.path(),
            SupervisorSettings::default(),
            FleetSettings::default(),
            None,
        )
        .unwrap();
        let token = devices.token();
        let (tasks, _fired) = TaskManager::new(Arc::new(devices), Arc::new(EventHub::new()));
        Self {
            _dir: dir,
            tasks: Arc::new(tasks),
            token,
        }
    }

    fn router(&self) -> Router {
        fleetd::router(Arc::clone(&self.tasks))
    }

    async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {}", self.token));
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    /// Serve the router on an ephemeral loopback port; returns its base URL.
    async fn serve(&self) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.router();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        format!("http://{addr}")
    }
}

#[tokio::test]
async fn requests_without_token_are_rejected() {
    let agent = Agent::new();

    let health = agent
        .router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let anonymous = agent
        .router()
        .oneshot(Request::get("/api/agent/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let device_header = agent
        .router()
        .oneshot(
            Request::get("/api/agent/status")
                .header("x-device-token", agent.token.as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(device_header.status(), StatusCode::OK);
}

#[tokio::test]
async fn agent_status_reports_identity() {
    let agent = Agent::new();
    let (status, body) = agent.call(Method::GET, "/api/agent/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "online");
    assert_eq!(body["id"], agent.tasks.devices().local_id());
}

#[tokio::test]
async fn task_crud_round_trip() {
    let agent = Agent::new();

    let (status, created) = agent
        .call(
            Method::POST,
            "/api/task/create",
            Some(json!({ "name": "hello", "command": "echo hello", "timeout": 30 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let id = created["id"].as_str().unwrap().to_string();

    let (status, listed) = agent.call(Method::GET, "/api/task/list", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["name"], "hello");
    assert_eq!(listed[0]["status"]["running"], false);

    let (status, updated) = agent
        .call(
            Method::POST,
            &format!("/api/task/{id}/update"),
            Some(json!({ "description": "greets" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["description"], "greets");

    let (status, body) = agent
        .call(Method::POST, &format!("/api/task/{id}/stop"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "not_running");

    let (status, _) = agent
        .call(Method::DELETE, &format!("/api/task/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = agent
        .call(Method::GET, &format!("/api/task/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_input_maps_to_client_errors() {
    let agent = Agent::new();

    let (status, body) = agent
        .call(
            Method::POST,
            "/api/task/create",
            Some(json!({ "name": "bad", "command": "true", "schedule": "every day" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("cron"));

    let (status, _) = agent
        .call(Method::POST, "/api/task/missing/start", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = agent
        .call(Method::POST, "/api/process/kill", Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = agent
        .call(Method::GET, "/api/task/list?device_id=nobody", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn peer_tasks_are_proxied_over_http() {
    let peer = Agent::new();
    let peer_url = peer.serve().await;
    let peer_id = peer.tasks.devices().local_id();

    let hub = Agent::new();
    let record = hub
        .tasks
        .devices()
        .add_peer(&peer_url, &peer.token)
        .await
        .unwrap();
    assert_eq!(record.id, peer_id);

    let created = hub
        .tasks
        .create(NewTask {
            name: "remote".into(),
            command: "echo remote".into(),
            device_id: Some(peer_id.clone()),
            ..NewTask::default()
        })
        .await
        .unwrap();
    assert_eq!(created.device_id, peer_id);
    assert!(peer.tasks.get(None, &created.id).await.is_ok());

    let listed = hub.tasks.list(Some(&peer_id)).await.unwrap();
    assert_eq!(listed.len(), 1);
    let fleet = hub.tasks.list_fleet().await;
    assert!(fleet.iter().any(|view| view.task.id == created.id));

    let stopped = hub.tasks.stop(Some(&peer_id), &created.id).await.unwrap();
    assert_eq!(stopped, StopOutcome::NotRunning);

    let (status, devices) = hub.call(Method::GET, "/api/devices", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(devices.as_array().unwrap().len(), 2);
    assert_eq!(devices[1]["type"], "Remote");
}

#[tokio::test]
async fn adding_self_as_peer_conflicts() {
    let agent = Agent::new();
    let url = agent.serve().await;
    let (status, _) = agent
        .call(
            Method::POST,
            "/api/devices/add",
            Some(json!({ "url": url, "token": agent.token })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn open_event_stream_does_not_block_graceful_shutdown() {
    let agent = Agent::new();
    let (stopping_tx, stopping_rx) = watch::channel(false);
    let app = fleetd::router_with_shutdown(Arc::clone(&agent.tasks), stopping_rx.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut signal = stopping_rx;
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = signal.wait_for(|stopping| *stopping).await;
            })
            .await
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /api/events/tasks?token={} HTTP/1.1\r\nHost: {addr}\r\nAccept: text/event-stream\r\n\r\n",
        agent.token
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    while !String::from_utf8_lossy(&received).contains("event: ready") {
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("ready event")
            .unwrap();
        assert!(read > 0, "stream closed before the ready event");
        received.extend_from_slice(&buf[..read]);
    }

    stopping_tx.send(true).unwrap();
    let stopped = tokio::time::timeout(Duration::from_secs(5), server).await;
    assert!(stopped.is_ok(), "server still draining an open event stream");

    // The subscriber sees the stream end rather than hang.
    let mut rest = Vec::new();
    let drained = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await;
    assert!(drained.is_ok());
}
