use std::{convert::Infallible, future::Future, pin::Pin, sync::Arc, time::Duration};

use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use fleet_common::{AckOutcome, MatchRequestItem, NewTask, StartOutcome, StopOutcome, TaskUpdate};
use fleet_orchestration::{
    DeviceError, TaskError, TaskManager, DEFAULT_LOG_TAIL_LINES,
};
use futures_core::Stream;
use futures_util::stream::once;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::auth::AuthManager;

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

#[derive(Clone)]
pub struct HttpState {
    inner: Arc<HttpStateInner>,
}

struct HttpStateInner {
    tasks: Arc<TaskManager>,
    auth: AuthManager,
    shutdown: watch::Receiver<bool>,
}

impl HttpState {
    /// `shutdown` flips to true when the server begins a graceful stop.
    pub fn new(tasks: Arc<TaskManager>, shutdown: watch::Receiver<bool>) -> Self {
        let auth = AuthManager::new(tasks.devices().token());
        Self {
            inner: Arc::new(HttpStateInner {
                tasks,
                auth,
                shutdown,
            }),
        }
    }

    /// Resolves once shutdown starts. Pends forever if no sender is wired.
    fn shutdown(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut shutdown = self.inner.shutdown.clone();
        async move {
            if shutdown.wait_for(|stopping| *stopping).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    fn ensure_authorized(&self, headers: &HeaderMap, query_token: Option<&str>) -> Result<(), ApiError> {
        if self.inner.auth.validate(headers, query_token) {
            Ok(())
        } else {
            Err(ApiError::Unauthorized)
        }
    }

    fn tasks(&self) -> &Arc<TaskManager> {
        &self.inner.tasks
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    BadGateway(String),
    Internal(anyhow::Error),
}

impl ApiError {
    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::NotFound(_) | TaskError::DeviceNotFound(_) => Self::NotFound(err.to_string()),
            TaskError::InvalidRequest(_) | TaskError::InvalidSchedule(_) => {
                Self::BadRequest(err.to_string())
            }
            TaskError::Remote(err) => Self::BadGateway(err.to_string()),
            TaskError::Persistence(err) => Self::internal(err),
        }
    }
}

impl From<DeviceError> for ApiError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::UnknownDevice(_) => Self::NotFound(err.to_string()),
            DeviceError::InvalidUrl(_) | DeviceError::Remote(_) => Self::BadRequest(err.to_string()),
            DeviceError::SelfPeer(_) => Self::Conflict(err.to_string()),
            DeviceError::PeerRejected(_) => Self::BadGateway(err.to_string()),
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::BadGateway(message) => (StatusCode::BAD_GATEWAY, message),
            ApiError::Internal(err) => {
                tracing::error!("HTTP handler error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Outcome objects travel as-is; an error outcome is a 500.
fn outcome<T: Serialize>(failed: bool, body: T) -> Response {
    let status = if failed {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct DeviceQuery {
    device_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    device_id: Option<String>,
    n: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ConfigBody {
    #[serde(default)]
    python_exec: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MatchBody {
    #[serde(default)]
    tasks: Vec<MatchRequestItem>,
}

#[derive(Debug, Deserialize)]
struct PidBody {
    #[serde(default)]
    pid: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AddPeerBody {
    url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct UpdateDeviceBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    python_exec: Option<String>,
}

/// The agent API served to clients and to peers acting as our proxy.
pub fn router(tasks: Arc<TaskManager>) -> Router {
    let (_never, shutdown) = watch::channel(false);
    router_with_shutdown(tasks, shutdown)
}

/// Like [`router`], but event streams end once `shutdown` turns true so a
/// graceful stop is not held open by subscribers.
pub fn router_with_shutdown(tasks: Arc<TaskManager>, shutdown: watch::Receiver<bool>) -> Router {
    let state = HttpState::new(tasks, shutdown);
    Router::new()
        .route("/health", get(health))
        .route("/api/agent/status", get(agent_status))
        .route("/api/agent/rename", post(agent_rename))
        .route("/api/agent/config", post(agent_config))
        .route("/api/agent/match_processes", post(match_processes))
        .route("/api/task/list", get(task_list))
        .route("/api/task/fleet", get(task_fleet))
        .route("/api/task/create", post(task_create))
        .route("/api/task/reorder", post(task_reorder))
        .route("/api/task/:id", get(task_get).delete(task_delete))
        .route("/api/task/:id/update", post(task_update))
        .route("/api/task/:id/start", post(task_start))
        .route("/api/task/:id/stop", post(task_stop))
        .route("/api/task/:id/logs", get(task_logs))
        .route("/api/task/:id/related_processes", get(task_related))
        .route("/api/task/:id/associate", post(task_associate))
        .route("/api/process/kill", post(process_kill))
        .route("/api/devices", get(devices_list))
        .route("/api/devices/add", post(devices_add))
        .route("/api/devices/:id", delete(devices_delete))
        .route("/api/devices/:id/update", post(devices_update))
        .route("/api/events/tasks", get(events_tasks))
        .route("/api/events/logs/:id", get(events_logs))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn agent_status(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    Ok(Json(state.tasks().devices().agent_status()).into_response())
}

async fn agent_rename(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Json(body): Json<RenameBody>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    let devices = state.tasks().devices();
    let ack = match devices.rename_device(&devices.local_id(), &body.name).await {
        Ok(()) => AckOutcome::Ok,
        Err(err) => AckOutcome::Error {
            message: err.to_string(),
        },
    };
    Ok(outcome(!ack.is_ok(), ack))
}

async fn agent_config(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Json(body): Json<ConfigBody>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let devices = state.tasks().devices();
    let ack = match devices
        .update_python_exec(&devices.local_id(), body.python_exec)
        .await
    {
        Ok(()) => AckOutcome::Ok,
        Err(err) => AckOutcome::Error {
            message: err.to_string(),
        },
    };
    Ok(outcome(!ack.is_ok(), ack))
}

async fn match_processes(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Json(body): Json<MatchBody>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let statuses = state
        .tasks()
        .devices()
        .local()
        .match_processes(&body.tasks)
        .await;
    Ok(Json(statuses).into_response())
}

async fn task_list(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let views = state.tasks().list(query.device_id.as_deref()).await?;
    Ok(Json(views).into_response())
}

async fn task_fleet(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    Ok(Json(state.tasks().list_fleet().await).into_response())
}

async fn task_create(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Query(query): Query<DeviceQuery>,
    Json(mut new): Json<NewTask>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    if new.device_id.is_none() {
        new.device_id = query.device_id;
    }
    let task = state.tasks().create(new).await?;
    Ok(Json(task).into_response())
}

async fn task_reorder(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Query(query): Query<DeviceQuery>,
    Json(ids): Json<Vec<String>>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    state
        .tasks()
        .reorder(query.device_id.as_deref(), &ids)
        .await?;
    Ok(Json(json!({ "status": "reordered" })).into_response())
}

async fn task_get(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let view = state.tasks().get(query.device_id.as_deref(), &id).await?;
    Ok(Json(view).into_response())
}

async fn task_update(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DeviceQuery>,
    Json(update): Json<TaskUpdate>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let task = state
        .tasks()
        .update(query.device_id.as_deref(), &id, update)
        .await?;
    Ok(Json(task).into_response())
}

async fn task_delete(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    state.tasks().delete(query.device_id.as_deref(), &id).await?;
    Ok(Json(json!({ "status": "deleted" })).into_response())
}

async fn task_start(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let started = state.tasks().start(query.device_id.as_deref(), &id).await?;
    Ok(outcome(matches!(started, StartOutcome::Error { .. }), started))
}

async fn task_stop(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let stopped = state.tasks().stop(query.device_id.as_deref(), &id).await?;
    Ok(outcome(matches!(stopped, StopOutcome::Error { .. }), stopped))
}

async fn task_logs(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let lines = query.n.unwrap_or(DEFAULT_LOG_TAIL_LINES);
    let logs = state
        .tasks()
        .logs(query.device_id.as_deref(), &id, lines)
        .await?;
    Ok(Json(json!({ "logs": logs })).into_response())
}

async fn task_related(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let related = state
        .tasks()
        .related(query.device_id.as_deref(), &id)
        .await?;
    Ok(Json(related).into_response())
}

async fn task_associate(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DeviceQuery>,
    Json(body): Json<PidBody>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let pid = body
        .pid
        .ok_or_else(|| ApiError::BadRequest("pid is required".to_string()))?;
    let associated = state
        .tasks()
        .associate(query.device_id.as_deref(), &id, pid)
        .await?;
    let failed = matches!(associated, fleet_common::AssociateOutcome::Error { .. });
    Ok(outcome(failed, associated))
}

async fn process_kill(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Query(query): Query<DeviceQuery>,
    Json(body): Json<PidBody>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let pid = body
        .pid
        .ok_or_else(|| ApiError::BadRequest("pid is required".to_string()))?;
    let killed = state.tasks().kill(query.device_id.as_deref(), pid).await?;
    let failed = matches!(killed, fleet_common::KillOutcome::Error { .. });
    Ok(outcome(failed, killed))
}

async fn devices_list(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    Ok(Json(state.tasks().devices().list_devices().await).into_response())
}

async fn devices_add(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Json(body): Json<AddPeerBody>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let peer = state
        .tasks()
        .devices()
        .add_peer(&body.url, &body.token)
        .await?;
    Ok(Json(json!({ "status": "added", "id": peer.id, "name": peer.name })).into_response())
}

async fn devices_delete(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let devices = state.tasks().devices();
    if devices.is_local(&id) {
        return Err(ApiError::BadRequest(
            "the local device cannot be removed".to_string(),
        ));
    }
    if !devices.remove_peer(&id).await? {
        return Err(ApiError::NotFound(format!("device not found: {id}")));
    }
    Ok(Json(json!({ "status": "deleted" })).into_response())
}

async fn devices_update(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateDeviceBody>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let devices = state.tasks().devices();
    let device_id = devices
        .resolve_id(&id)
        .ok_or_else(|| ApiError::NotFound(format!("device not found: {id}")))?;
    if let Some(name) = body.name.filter(|name| !name.trim().is_empty()) {
        devices.rename_device(&device_id, &name).await?;
    }
    if let Some(python_exec) = body.python_exec {
        devices
            .update_python_exec(&device_id, Some(python_exec))
            .await?;
    }
    Ok(Json(json!({ "status": "updated" })).into_response())
}

fn ready_event() -> impl Stream<Item = Result<Event, Infallible>> {
    once(async { Ok::<Event, Infallible>(Event::default().event("ready").data("{}")) })
}

/// Ready event first, then `updates` until the server shuts down.
fn event_stream<S>(state: &HttpState, updates: S) -> EventStream
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    let merged = futures_util::stream::select(ready_event(), updates);
    Box::pin(futures_util::StreamExt::take_until(merged, state.shutdown()))
}

fn keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(Duration::from_secs(15))
        .text("keep-alive")
}

async fn events_tasks(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Sse<EventStream>, ApiError> {
    state.ensure_authorized(&headers, query.token.as_deref())?;

    let receiver = state.tasks().hub().subscribe_tasks();
    let updates = BroadcastStream::new(receiver).filter_map(|event| match event {
        Ok(views) => match serde_json::to_string(&*views) {
            Ok(data) => Some(Ok(Event::default().event("tasks").data(data))),
            Err(err) => {
                tracing::error!("Failed to serialize task list: {err}");
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!("task subscriber lagged by {skipped} updates");
            None
        }
    });

    Ok(Sse::new(event_stream(&state, updates)).keep_alive(keep_alive()))
}

async fn events_logs(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Sse<EventStream>, ApiError> {
    state.ensure_authorized(&headers, query.token.as_deref())?;

    let receiver = state.tasks().hub().subscribe_logs();
    let lines = BroadcastStream::new(receiver).filter_map(move |event| match event {
        Ok(line) if line.task_id == task_id => Some(Ok(Event::default().event("log").data(line.line))),
        Ok(_) => None,
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!(%task_id, "log subscriber lagged by {skipped} lines");
            None
        }
    });

    Ok(Sse::new(event_stream(&state, lines)).keep_alive(keep_alive()))
}
