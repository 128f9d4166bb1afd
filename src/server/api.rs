use std::path::Path as FsPath;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response, Sse},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{FlowError, RunnerError};
use crate::flow::models::validate_id;
use crate::flow::{
    EventHub, ExecutionContext, ExecutionSource, FlowBinding, FlowEvent, FlowManager, FlowTracker,
    PendingExecution, now_ms,
};
use crate::runner::{ExecuteRequest, ExecutionBackend, RunKind, RunnerOption, StartRequest};

use super::sse::{SubscriptionGuard, event_stream};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub flows: Arc<FlowManager>,
    pub hub: Arc<EventHub>,
    pub backend: Arc<dyn ExecutionBackend>,
    pub context: Arc<dyn ExecutionContext>,
    pub heartbeat: Duration,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        flows: Arc<FlowManager>,
        hub: Arc<EventHub>,
        backend: Arc<dyn ExecutionBackend>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            context: Arc::new(HubContext(Arc::clone(&hub))),
            flows,
            hub,
            backend,
            heartbeat,
        }
    }
}

/// Publishes events of flowless executions on the session hub.
pub struct HubContext(pub Arc<EventHub>);

impl ExecutionContext for HubContext {
    fn on_event(&self, session_id: Option<&str>, run_id: &str, event: &FlowEvent) {
        self.0.publish(session_id, run_id, event);
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CreateFlowRequest {
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventQuery {
    pub flow_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnersQuery {
    pub file_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub file_path: String,
    #[serde(default)]
    pub runner_id: Option<String>,
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub req_exec_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequestBody {
    pub content: String,
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub request_name: Option<String>,
    #[serde(default)]
    pub request_index: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunnerList {
    pub options: Vec<RunnerOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedRun {
    pub run_id: String,
    pub flow_id: Option<String>,
    pub req_exec_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResult {
    pub cancelled: bool,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    NotImplemented(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::NotImplemented(msg) => (StatusCode::NOT_IMPLEMENTED, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<FlowError> for ApiError {
    fn from(e: FlowError) -> Self {
        let msg = e.to_string();
        match e {
            FlowError::InvalidId { .. } => ApiError::BadRequest(msg),
            FlowError::FlowNotFound { .. } | FlowError::ExecutionNotFound { .. } => {
                ApiError::NotFound(msg)
            }
            FlowError::FlowFinished { .. } | FlowError::ExecutionExists { .. } => {
                ApiError::Conflict(msg)
            }
            FlowError::LockPoisoned { .. } => ApiError::Internal(msg),
        }
    }
}

impl From<RunnerError> for ApiError {
    fn from(e: RunnerError) -> Self {
        let msg = e.to_string();
        match e {
            RunnerError::Unsupported { .. } => ApiError::NotImplemented(msg),
            RunnerError::NoRunner { .. } | RunnerError::UnknownRunner { .. } => {
                ApiError::BadRequest(msg)
            }
            RunnerError::SpawnFailed { .. } | RunnerError::Other(_) => ApiError::Internal(msg),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/flows", post(create_flow))
        .route("/flows/{flow_id}", get(get_flow).delete(delete_flow))
        .route("/flows/{flow_id}/finish", post(finish_flow))
        .route(
            "/flows/{flow_id}/executions/{req_exec_id}",
            get(get_execution),
        )
        .route("/event", get(event_stream_handler))
        .route("/script/runners", get(list_script_runners))
        .route("/test/frameworks", get(list_test_frameworks))
        .route("/script", post(start_script))
        .route("/test", post(start_test))
        .route("/script/{run_id}", delete(cancel_run))
        .route("/test/{run_id}", delete(cancel_run))
        .route("/execute", post(execute_request))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn label_for(file_path: &str) -> String {
    FsPath::new(file_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.to_string())
}

/// Resolve the flow a new execution joins: the requested one, or a fresh
/// flow. Whether a requested flow still accepts executions is decided when
/// the pending record is inserted.
fn join_or_create_flow(
    flows: &FlowManager,
    flow_id: Option<String>,
    label: &str,
) -> Result<String, ApiError> {
    match flow_id {
        Some(flow_id) => {
            validate_id("flow id", &flow_id)?;
            Ok(flow_id)
        }
        None => Ok(flows.create(Some(label.to_string())).flow_id),
    }
}

fn execution_id(requested: Option<String>) -> Result<String, ApiError> {
    match requested {
        Some(id) => {
            validate_id("execution id", &id)?;
            Ok(id)
        }
        None => Ok(Uuid::new_v4().to_string()),
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn create_flow(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        CreateFlowRequest::default()
    } else {
        serde_json::from_slice::<CreateFlowRequest>(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))?
    };
    let created = state.flows.create(req.label);
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_flow(
    State(state): State<SharedState>,
    Path(flow_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_id("flow id", &flow_id)?;
    match state.flows.get(&flow_id) {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(FlowError::FlowNotFound { flow_id }.into()),
    }
}

async fn delete_flow(
    State(state): State<SharedState>,
    Path(flow_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_id("flow id", &flow_id)?;
    state.flows.dispose(&flow_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn finish_flow(
    State(state): State<SharedState>,
    Path(flow_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.flows.finish(&flow_id)?))
}

async fn get_execution(
    State(state): State<SharedState>,
    Path((flow_id, req_exec_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.flows.get_execution(&flow_id, &req_exec_id)?))
}

const LAST_EVENT_ID: &str = "last-event-id";

/// `Last-Event-ID` as a flow `seq`. Anything unparsable starts fresh.
fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

async fn event_stream_handler(
    State(state): State<SharedState>,
    Query(query): Query<EventQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let (receiver, backlog, guard) = match query.flow_id {
        Some(flow_id) => {
            let sub = state
                .flows
                .subscribe_after(&flow_id, last_event_id(&headers))?;
            let guard = SubscriptionGuard::Flow {
                flows: Arc::clone(&state.flows),
                flow_id,
                id: sub.id,
            };
            (sub.receiver, sub.backlog, guard)
        }
        None => {
            let (id, receiver) = state.hub.subscribe(query.session_id);
            let guard = SubscriptionGuard::Session {
                hub: Arc::clone(&state.hub),
                id,
            };
            (receiver, Vec::new(), guard)
        }
    };
    Ok(Sse::new(event_stream(
        receiver,
        backlog,
        guard,
        state.heartbeat,
    )))
}

fn list_runners(state: &SharedState, kind: RunKind, file_path: &str) -> Json<RunnerList> {
    Json(RunnerList {
        options: state.backend.detect_runners(kind, file_path),
    })
}

async fn list_script_runners(
    State(state): State<SharedState>,
    Query(query): Query<RunnersQuery>,
) -> impl IntoResponse {
    list_runners(&state, RunKind::Script, &query.file_path)
}

async fn list_test_frameworks(
    State(state): State<SharedState>,
    Query(query): Query<RunnersQuery>,
) -> impl IntoResponse {
    list_runners(&state, RunKind::Test, &query.file_path)
}

async fn start_run(
    state: SharedState,
    kind: RunKind,
    req: StartRunRequest,
) -> Result<(StatusCode, Json<StartedRun>), ApiError> {
    let label = label_for(&req.file_path);
    let req_exec_id = execution_id(req.req_exec_id)?;
    let flow_id = join_or_create_flow(&state.flows, req.flow_id, &label)?;
    let run_id = Uuid::new_v4().to_string();

    let tracker = FlowTracker::new(
        Some(FlowBinding::new(Arc::clone(&state.flows), &flow_id)),
        Arc::clone(&state.context),
        &run_id,
        Some(req_exec_id.clone()),
        now_ms(),
    );
    // A finished flow or a reused reqExecId is refused before anything runs.
    tracker.try_init_pending_execution(PendingExecution {
        session_id: req.session_id.clone(),
        req_label: Some(label),
        source: ExecutionSource::file(&req.file_path),
        ..PendingExecution::default()
    })?;

    let started = state
        .backend
        .start(StartRequest {
            kind,
            file_path: req.file_path,
            runner_id: req.runner_id,
            tracker: tracker.clone(),
            session_id: req.session_id,
        })
        .await;
    if let Err(e) = started {
        tracker.fail_execution(kind.as_str(), &e.to_string());
        return Err(e.into());
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(StartedRun {
            run_id,
            flow_id: Some(flow_id),
            req_exec_id,
        }),
    ))
}

async fn start_script(
    State(state): State<SharedState>,
    Json(req): Json<StartRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    start_run(state, RunKind::Script, req).await
}

async fn start_test(
    State(state): State<SharedState>,
    Json(req): Json<StartRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    start_run(state, RunKind::Test, req).await
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    validate_id("run id", &run_id)?;
    let outcome = state.backend.cancel(&run_id).await;
    Ok(Json(CancelResult {
        cancelled: outcome.cancelled(),
    }))
}

/// Without a `flowId` the execution is tracked without a flow and its events
/// go to the session hub.
async fn execute_request(
    State(state): State<SharedState>,
    Json(req): Json<ExecuteRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = Uuid::new_v4().to_string();
    let req_exec_id = Uuid::new_v4().to_string();
    let binding = req
        .flow_id
        .map(|flow_id| FlowBinding::new(Arc::clone(&state.flows), flow_id));
    let flow_id = binding.as_ref().map(|b| b.flow_id.clone());

    let tracker = FlowTracker::new(
        binding,
        Arc::clone(&state.context),
        &run_id,
        Some(req_exec_id.clone()),
        now_ms(),
    );
    tracker.try_init_pending_execution(PendingExecution {
        session_id: req.session_id.clone(),
        req_label: req.request_name.clone(),
        source: ExecutionSource {
            request_index: req.request_index,
            request_name: req.request_name.clone(),
            ..ExecutionSource::inline()
        },
        ..PendingExecution::default()
    })?;

    let executed = state
        .backend
        .execute(ExecuteRequest {
            content: req.content,
            request_name: req.request_name,
            request_index: req.request_index,
            tracker: tracker.clone(),
            session_id: req.session_id,
        })
        .await;
    if let Err(e) = executed {
        tracker.fail_execution("execute", &e.to_string());
        return Err(e.into());
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(StartedRun {
            run_id,
            flow_id,
            req_exec_id,
        }),
    ))
}
