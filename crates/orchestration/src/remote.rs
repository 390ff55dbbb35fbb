use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fleet_common::{
    AckOutcome, AgentStatus, AssociateOutcome, DeviceInfo, DeviceKind, KillOutcome, NewTask,
    RelatedProcess, StartOutcome, StopOutcome, Task, TaskStatus, TaskUpdate, TaskView,
};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::device::Device;
use crate::error::RemoteError;
use crate::types::LaunchSpec;

/// Connection info for a peer agent, as stored in `peers.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    pub token: String,
    #[serde(default)]
    pub python_exec: Option<String>,
}

enum StatusCache {
    Empty,
    Fresh(HashMap<String, TaskStatus>),
    Failed(String),
}

#[derive(Deserialize)]
struct LogsBody {
    #[serde(default)]
    logs: Vec<String>,
}

/// Proxy for a task-running agent on another machine.
///
/// Cheap to build; the device manager creates a fresh one per use so no
/// peer state outlives the call that needed it.
pub struct RemoteDevice {
    peer: PeerRecord,
    client: Client,
    timeout: Duration,
    statuses: Mutex<StatusCache>,
}

impl RemoteDevice {
    pub fn new(peer: PeerRecord, client: Client, timeout: Duration) -> Self {
        Self {
            peer,
            client,
            timeout,
            statuses: Mutex::new(StatusCache::Empty),
        }
    }

    pub fn peer(&self) -> &PeerRecord {
        &self.peer
    }

    fn label(&self) -> String {
        if self.peer.id.is_empty() {
            self.peer.url.clone()
        } else {
            self.peer.id.clone()
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.peer.url.trim_end_matches('/'), path);
        self.client
            .request(method, url)
            .bearer_auth(&self.peer.token)
            .timeout(self.timeout)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RemoteError> {
        let response = request.send().await.map_err(|source| RemoteError::Transport {
            peer: self.label(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                peer: self.label(),
                status: status.as_u16(),
                message: error_text(&body),
            });
        }
        response.json::<T>().await.map_err(|source| RemoteError::Decode {
            peer: self.label(),
            source,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        self.send(self.request(Method::GET, path)).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    pub async fn fetch_status(&self) -> Result<AgentStatus, RemoteError> {
        self.get("/api/agent/status").await
    }

    /// Bulk task list; also refreshes the status cache used by `task_status`.
    pub async fn list_tasks(&self) -> Result<Vec<TaskView>, RemoteError> {
        let result = self.get::<Vec<TaskView>>("/api/task/list").await;
        let cache = match &result {
            Ok(views) => StatusCache::Fresh(
                views
                    .iter()
                    .map(|view| (view.task.id.clone(), view.status.clone()))
                    .collect(),
            ),
            Err(err) => StatusCache::Failed(err.to_string()),
        };
        if let Ok(mut statuses) = self.statuses.lock() {
            *statuses = cache;
        }
        result
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskView, RemoteError> {
        self.get(&format!("/api/task/{task_id}")).await
    }

    pub async fn create_task(&self, new: &NewTask) -> Result<Task, RemoteError> {
        self.post("/api/task/create", new).await
    }

    pub async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task, RemoteError> {
        self.post(&format!("/api/task/{task_id}/update"), update).await
    }

    pub async fn delete_task(&self, task_id: &str) -> Result<(), RemoteError> {
        self.send::<Value>(self.request(Method::DELETE, &format!("/api/task/{task_id}")))
            .await
            .map(|_| ())
    }

    pub async fn reorder(&self, ids: &[String]) -> Result<(), RemoteError> {
        self.post::<_, Value>("/api/task/reorder", ids).await.map(|_| ())
    }

    pub async fn rename(&self, name: &str) -> AckOutcome {
        self.post("/api/agent/rename", &json!({ "name": name }))
            .await
            .unwrap_or_else(|err| self.ack_error(err))
    }

    pub async fn push_config(&self, python_exec: Option<&str>) -> AckOutcome {
        self.post("/api/agent/config", &json!({ "python_exec": python_exec }))
            .await
            .unwrap_or_else(|err| self.ack_error(err))
    }

    fn ack_error(&self, err: RemoteError) -> AckOutcome {
        warn!(peer = %self.label(), error = %err, "peer call failed");
        AckOutcome::Error {
            message: err.to_string(),
        }
    }

    fn cached_status(&self, task_id: &str) -> Option<TaskStatus> {
        let statuses = self.statuses.lock().ok()?;
        match &*statuses {
            StatusCache::Empty => None,
            StatusCache::Fresh(map) => Some(
                map.get(task_id)
                    .cloned()
                    .unwrap_or_else(|| TaskStatus::idle(task_id)),
            ),
            StatusCache::Failed(message) => Some(TaskStatus {
                message: Some(message.clone()),
                ..TaskStatus::idle(task_id)
            }),
        }
    }
}

/// Pull a readable message out of an error body (`{"message"}` or `{"error"}`).
fn error_text(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .or_else(|| value.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl Device for RemoteDevice {
    fn id(&self) -> &str {
        &self.peer.id
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.peer.id.clone(),
            name: self.peer.name.clone(),
            kind: DeviceKind::Remote,
            url: Some(self.peer.url.clone()),
            python_exec: self.peer.python_exec.clone(),
        }
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Remote
    }

    async fn start_task(&self, spec: &LaunchSpec) -> StartOutcome {
        self.post(&format!("/api/task/{}/start", spec.task_id), &json!({}))
            .await
            .unwrap_or_else(|err| {
                warn!(peer = %self.label(), task_id = %spec.task_id, error = %err, "remote start failed");
                StartOutcome::Error {
                    message: err.to_string(),
                }
            })
    }

    async fn stop_task(&self, task_id: &str) -> StopOutcome {
        self.post(&format!("/api/task/{task_id}/stop"), &json!({}))
            .await
            .unwrap_or_else(|err| {
                warn!(peer = %self.label(), %task_id, error = %err, "remote stop failed");
                StopOutcome::Error {
                    message: err.to_string(),
                }
            })
    }

    async fn task_status(&self, task_id: &str) -> TaskStatus {
        if let Some(status) = self.cached_status(task_id) {
            return status;
        }
        // Fill the cache with one bulk call rather than polling per task.
        let _ = self.list_tasks().await;
        self.cached_status(task_id)
            .unwrap_or_else(|| TaskStatus::idle(task_id))
    }

    async fn scan(&self, _tasks: &[Task]) {
        if let Err(err) = self.list_tasks().await {
            debug!(peer = %self.label(), error = %err, "remote scan failed");
        }
    }

    async fn logs(&self, task_id: &str, lines: usize) -> Vec<String> {
        match self
            .get::<LogsBody>(&format!("/api/task/{task_id}/logs?n={lines}"))
            .await
        {
            Ok(body) => body.logs,
            Err(err) => {
                warn!(peer = %self.label(), %task_id, error = %err, "remote log fetch failed");
                Vec::new()
            }
        }
    }

    async fn find_related(&self, task_id: &str, _command: &str) -> Vec<RelatedProcess> {
        match self
            .get(&format!("/api/task/{task_id}/related_processes"))
            .await
        {
            Ok(found) => found,
            Err(err) => {
                warn!(peer = %self.label(), %task_id, error = %err, "remote related lookup failed");
                Vec::new()
            }
        }
    }

    async fn kill_process(&self, pid: u32) -> KillOutcome {
        self.post("/api/process/kill", &json!({ "pid": pid }))
            .await
            .unwrap_or_else(|err| KillOutcome::Error {
                message: err.to_string(),
            })
    }

    async fn associate(&self, task_id: &str, pid: u32) -> AssociateOutcome {
        self.post(&format!("/api/task/{task_id}/associate"), &json!({ "pid": pid }))
            .await
            .unwrap_or_else(|err| AssociateOutcome::Error {
                message: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_peer() -> RemoteDevice {
        RemoteDevice::new(
            PeerRecord {
                id: "peer-1".into(),
                name: "peer".into(),
                // Reserved port on loopback; nothing listens there.
                url: "http://127.0.0.1:9/".into(),
                token: "t".into(),
                python_exec: None,
            },
            Client::new(),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn error_text_prefers_message_fields() {
        assert_eq!(error_text(r#"{"status":"error","message":"boom"}"#), "boom");
        assert_eq!(error_text(r#"{"error":"unauthorized"}"#), "unauthorized");
        assert_eq!(error_text(" plain "), "plain");
    }

    #[tokio::test]
    async fn unreachable_peer_yields_error_values() {
        let peer = unreachable_peer();
        assert!(matches!(
            peer.start_task(&LaunchSpec::by_id("t")).await,
            StartOutcome::Error { .. }
        ));
        assert!(matches!(peer.stop_task("t").await, StopOutcome::Error { .. }));
        assert!(matches!(peer.kill_process(1).await, KillOutcome::Error { .. }));
        assert!(peer.logs("t", 10).await.is_empty());

        let status = peer.task_status("t").await;
        assert!(!status.running);
        assert!(status.message.is_some());
    }
}
