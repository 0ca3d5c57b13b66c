//! HTTP surface for task control and progress observation.
//!
//! Exposes the orchestrator over axum: task start/control endpoints, a poll
//! endpoint returning the latest snapshot, and a server-sent-events stream
//! as the push transport. Every stream opens with a `connected` event and
//! closes itself after a terminal event, so a follower can tell a finished
//! task from a broken connection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::stream::{self, BoxStream, Stream};
use futures::{StreamExt, future};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use crate::error::SyncError;
use crate::orchestrator::SyncOrchestrator;
use crate::progress::ProgressEvent;
use crate::task::{ProgressSnapshot, TaskKind, TaskStatus};

/// Body for `POST /tasks`.
#[derive(Debug, Deserialize)]
pub struct StartTaskRequest {
    pub kind: TaskKind,
    pub target: String,
}

/// Response carrying a task id.
#[derive(Debug, Serialize)]
pub struct TaskRef {
    pub task_id: String,
}

/// Acknowledgement for the control endpoints.
#[derive(Debug, Serialize)]
pub struct Ack {
    pub ok: bool,
    pub message: String,
}

impl Ack {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            ok: true,
            message: message.into(),
        })
    }
}

/// Response for the poll endpoint.
#[derive(Debug, Serialize)]
pub struct TaskProgressResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: ProgressSnapshot,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        let message = e.to_string();
        let status = match &e {
            // A held import lock is a conflict; any other config complaint
            // about an id means the task is unknown.
            SyncError::Config { message } if message.contains("locked") => StatusCode::CONFLICT,
            SyncError::Config { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

/// Build the API router around a shared orchestrator.
pub fn router(orchestrator: Arc<SyncOrchestrator>) -> Router {
    Router::new()
        .route("/tasks", post(start_task))
        .route("/tasks/{task_id}/progress", get(task_progress))
        .route("/tasks/{task_id}/events", get(task_events))
        .route("/tasks/{task_id}/pause", post(pause_task))
        .route("/tasks/{task_id}/resume", post(resume_task))
        .route("/tasks/{task_id}/cancel", post(cancel_task))
        .route("/tasks/{task_id}/retry", post(retry_task))
        .with_state(orchestrator)
}

/// Bind and serve the API until the process stops.
///
/// # Errors
/// Returns `SyncError::Transport` if the listener cannot bind or the
/// server fails.
pub async fn serve(orchestrator: Arc<SyncOrchestrator>, addr: SocketAddr) -> crate::Result<()> {
    let app = router(orchestrator);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| SyncError::transport(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "api server listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| SyncError::transport(format!("server error: {e}")))
}

async fn start_task(
    State(orchestrator): State<Arc<SyncOrchestrator>>,
    Json(request): Json<StartTaskRequest>,
) -> Result<(StatusCode, Json<TaskRef>), ApiError> {
    let task_id = orchestrator.start(request.kind, &request.target)?;
    Ok((StatusCode::ACCEPTED, Json(TaskRef { task_id })))
}

async fn task_progress(
    State(orchestrator): State<Arc<SyncOrchestrator>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskProgressResponse>, ApiError> {
    match orchestrator.status(&task_id).await? {
        Some((status, progress)) => Ok(Json(TaskProgressResponse {
            task_id,
            status,
            progress,
        })),
        None => Err(ApiError::not_found(format!("no task {task_id}"))),
    }
}

/// The push transport: `connected`, then live events, ending after the
/// terminal event for the task.
async fn task_events(
    State(orchestrator): State<Arc<SyncOrchestrator>>,
    Path(task_id): Path<String>,
) -> Sse<KeepAliveStream<BoxStream<'static, Result<Event, axum::Error>>>> {
    let subscription = orchestrator.channel().subscribe(&task_id);
    let connected = subscription.connected;

    let events: BoxStream<'static, ProgressEvent> = match subscription.receiver {
        Some(rx) => {
            let live = BroadcastStream::new(rx)
                // A lagging reader skips to newer events instead of erroring.
                .filter_map(|result| async move { result.ok() });
            until_terminal(stream::once(async move { connected }).chain(live)).boxed()
        }
        // Unknown task: the single not_found event ends the stream.
        None => stream::once(async move { connected }).boxed(),
    };

    let stream = events
        .map(|event| Event::default().json_data(&event))
        .boxed();
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Pass events through until the terminal one, which is emitted and then
/// ends the stream immediately.
fn until_terminal<S>(events: S) -> impl Stream<Item = ProgressEvent>
where
    S: Stream<Item = ProgressEvent>,
{
    events
        .flat_map(|event| {
            let last = event.is_terminal();
            let mut out = vec![Some(event)];
            if last {
                out.push(None);
            }
            stream::iter(out)
        })
        .take_while(|item| future::ready(item.is_some()))
        .filter_map(future::ready)
}

async fn pause_task(
    State(orchestrator): State<Arc<SyncOrchestrator>>,
    Path(task_id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    orchestrator.pause(&task_id)?;
    Ok(Ack::new(format!("task {task_id} paused")))
}

async fn resume_task(
    State(orchestrator): State<Arc<SyncOrchestrator>>,
    Path(task_id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    orchestrator.resume(&task_id)?;
    Ok(Ack::new(format!("task {task_id} resumed")))
}

async fn cancel_task(
    State(orchestrator): State<Arc<SyncOrchestrator>>,
    Path(task_id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    orchestrator.cancel(&task_id)?;
    Ok(Ack::new(format!("cancellation requested for task {task_id}")))
}

async fn retry_task(
    State(orchestrator): State<Arc<SyncOrchestrator>>,
    Path(task_id): Path<String>,
) -> Result<(StatusCode, Json<TaskRef>), ApiError> {
    let retry_id = orchestrator.retry_failed(&task_id)?;
    Ok((StatusCode::ACCEPTED, Json(TaskRef { task_id: retry_id })))
}
