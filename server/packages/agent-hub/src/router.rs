//! HTTP surface and turn pipeline: thread CRUD, streaming turns over SSE,
//! cancel/compact, history, and the permission decision endpoint.

use std::collections::HashSet;
use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_hub_error::{ErrorBody, ErrorCode, ErrorEnvelope, HubError};
use agent_hub_storage::{
    CreateThreadParams, CreateTurnParams, FinalizeTurnParams, StorageError, Store, Thread, Turn,
};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::agents::{
    DeltaSink, PermissionHandler, PermissionOutcome, PermissionRequest, PermissionResponse,
    StopReason, Streamer, TurnContext,
};
use crate::cache::{AgentFactory, ThreadAgentCache, DEFAULT_AGENT_IDLE_TTL};
use crate::compose;
use crate::permissions::{PermissionBroker, PermissionError, DEFAULT_PERMISSION_TIMEOUT};
use crate::runtime::{TurnController, TurnControllerError};
use crate::sse::{self, TurnEventStream};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CONTEXT_RECENT_TURNS: usize = 10;
pub const DEFAULT_CONTEXT_MAX_CHARS: usize = 20_000;
pub const DEFAULT_COMPACT_MAX_CHARS: usize = 4_000;

const SSE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

/// Tunable limits and the agent surface exposed by this server instance.
#[derive(Clone)]
pub struct HubConfig {
    pub agents: Vec<AgentInfo>,
    pub allowed_agents: Vec<String>,
    pub allowed_roots: Vec<PathBuf>,
    pub context_recent_turns: usize,
    pub context_max_chars: usize,
    pub compact_max_chars: usize,
    pub permission_timeout: Duration,
    pub agent_idle_ttl: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            agents: Vec::new(),
            allowed_agents: Vec::new(),
            allowed_roots: vec![PathBuf::from("/")],
            context_recent_turns: DEFAULT_CONTEXT_RECENT_TURNS,
            context_max_chars: DEFAULT_CONTEXT_MAX_CHARS,
            compact_max_chars: DEFAULT_COMPACT_MAX_CHARS,
            permission_timeout: DEFAULT_PERMISSION_TIMEOUT,
            agent_idle_ttl: DEFAULT_AGENT_IDLE_TTL,
        }
    }
}

pub struct AppState {
    auth: AuthConfig,
    store: Store,
    agents: Vec<AgentInfo>,
    allowed_agents: HashSet<String>,
    allowed_roots: Vec<PathBuf>,
    controller: Arc<TurnController>,
    permissions: Arc<PermissionBroker>,
    agent_cache: Arc<ThreadAgentCache>,
    context_recent_turns: usize,
    context_max_chars: usize,
    compact_max_chars: usize,
}

impl AppState {
    pub fn new(auth: AuthConfig, store: Store, factory: AgentFactory, config: HubConfig) -> Arc<Self> {
        let controller = Arc::new(TurnController::new());
        let permissions = Arc::new(PermissionBroker::new(config.permission_timeout));
        let agent_cache =
            ThreadAgentCache::new(factory, config.agent_idle_ttl, controller.clone());

        let allowed_agents = config
            .allowed_agents
            .iter()
            .map(|agent| agent.trim().to_string())
            .filter(|agent| !agent.is_empty())
            .collect();
        let allowed_roots = config
            .allowed_roots
            .iter()
            .map(|root| clean_path(root))
            .collect();

        Arc::new(Self {
            auth,
            store,
            agents: config.agents,
            allowed_agents,
            allowed_roots,
            controller,
            permissions,
            agent_cache,
            context_recent_turns: config.context_recent_turns.max(1),
            context_max_chars: config.context_max_chars.max(1),
            compact_max_chars: config.compact_max_chars.max(1),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn controller(&self) -> &Arc<TurnController> {
        &self.controller
    }

    /// Graceful drain: wait for active turns, force-cancel on timeout, then
    /// tear down cached providers and close storage.
    pub async fn shutdown(&self, grace: Duration) {
        if !self.controller.wait_for_idle(grace).await {
            let cancelled = self.controller.cancel_all();
            tracing::warn!(cancelled, "force-cancelled active turns during shutdown");
            let _ = self
                .controller
                .wait_for_idle(Duration::from_secs(2))
                .await;
        }
        self.agent_cache.shutdown().await;
        self.store.close().await;
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/agents", get(list_agents))
        .route("/threads", post(create_thread).get(list_threads))
        .route("/threads/:thread_id", get(get_thread))
        .route("/threads/:thread_id/turns", post(create_turn_stream))
        .route("/threads/:thread_id/history", get(thread_history))
        .route("/threads/:thread_id/compact", post(compact_thread))
        .route("/turns/:turn_id/cancel", post(cancel_turn))
        .route("/permissions/:permission_id", post(decide_permission))
        .layer(middleware::from_fn_with_state(state.clone(), require_client))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri()
            )
        })
        .on_response(|response: &Response, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %response.status(),
                latency_ms = latency.as_millis() as u64,
                "request completed"
            );
        });

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", v1)
        .fallback(not_found)
        .layer(trace_layer)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        healthz,
        list_agents,
        create_thread,
        list_threads,
        get_thread,
        create_turn_stream,
        cancel_turn,
        thread_history,
        compact_thread,
        decide_permission
    ),
    components(schemas(
        AgentInfo,
        AgentListResponse,
        HealthResponse,
        CreateThreadRequest,
        CreateThreadResponse,
        ThreadBody,
        ThreadListResponse,
        ThreadResponse,
        TurnRequest,
        CancelTurnResponse,
        CompactRequest,
        CompactResponse,
        TurnHistoryBody,
        EventBody,
        HistoryResponse,
        PermissionDecisionRequest,
        PermissionDecisionResponse,
        ErrorEnvelope,
        ErrorBody,
        ErrorCode
    )),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "threads", description = "Thread management"),
        (name = "turns", description = "Turn streaming and control"),
        (name = "permissions", description = "Permission decisions")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] HubError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_envelope())).into_response()
    }
}

/// Client identity attached by [`require_client`].
#[derive(Debug, Clone)]
pub struct ClientId(pub String);

// ---------------------------------------------------------------------------
// Wire types

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AgentListResponse {
    pub agents: Vec<AgentInfo>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub ok: bool,
}

#[derive(Debug, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateThreadRequest {
    pub agent: String,
    pub cwd: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub agent_options: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateThreadResponse {
    pub thread_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThreadBody {
    pub thread_id: String,
    pub agent: String,
    pub cwd: String,
    pub title: String,
    #[schema(value_type = Object)]
    pub agent_options: Value,
    pub summary: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ThreadListResponse {
    pub threads: Vec<ThreadBody>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ThreadResponse {
    pub thread: ThreadBody,
}

#[derive(Debug, Deserialize, JsonSchema, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct TurnRequest {
    pub input: String,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelTurnResponse {
    pub turn_id: String,
    pub thread_id: String,
    pub status: String,
}

#[derive(Debug, Default, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CompactRequest {
    #[serde(default)]
    pub max_summary_chars: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompactResponse {
    pub thread_id: String,
    pub turn_id: String,
    pub status: String,
    pub stop_reason: String,
    pub summary: String,
    pub summary_chars: usize,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TurnHistoryBody {
    pub turn_id: String,
    pub request_text: String,
    pub response_text: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_internal: bool,
    pub status: String,
    pub stop_reason: String,
    pub error_message: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<EventBody>>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventBody {
    pub event_id: i64,
    pub seq: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[schema(value_type = Object)]
    pub data: Value,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HistoryResponse {
    pub turns: Vec<TurnHistoryBody>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default, rename = "includeEvents")]
    include_events: Option<String>,
    #[serde(default, rename = "includeInternal")]
    include_internal: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct PermissionDecisionRequest {
    pub outcome: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecisionResponse {
    pub permission_id: String,
    pub status: String,
    pub outcome: String,
}

// ---------------------------------------------------------------------------
// Middleware

async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = &state.auth.token else {
        return Ok(next.run(request).await);
    };

    match bearer_token(request.headers()) {
        Some(provided) if constant_time_eq(provided.as_bytes(), expected.as_bytes()) => {
            Ok(next.run(request).await)
        }
        _ => Err(HubError::unauthorized("missing or invalid bearer token")
            .with_detail("header", "Authorization")
            .into()),
    }
}

async fn require_client(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let client_id = request
        .headers()
        .get("x-client-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or("")
        .to_string();
    if client_id.is_empty() {
        return Err(HubError::invalid_argument("missing required header X-Client-ID")
            .with_detail("header", "X-Client-ID")
            .into());
    }

    state
        .store
        .upsert_client(&client_id)
        .await
        .map_err(|err| HubError::internal(format!("failed to upsert client: {err}")))?;

    request.extensions_mut().insert(ClientId(client_id));
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Ported timing-safe comparison; never early-exits on a byte mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ---------------------------------------------------------------------------
// Handlers

#[utoipa::path(get, path = "/healthz", responses((status = 200, body = HealthResponse)), tag = "meta")]
async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn not_found(uri: axum::http::Uri) -> ApiError {
    HubError::not_found("endpoint not found")
        .with_detail("path", uri.path())
        .into()
}

#[utoipa::path(
    get,
    path = "/v1/agents",
    responses((status = 200, body = AgentListResponse), (status = 401, body = ErrorEnvelope)),
    tag = "meta"
)]
async fn list_agents(State(state): State<Arc<AppState>>) -> Json<AgentListResponse> {
    Json(AgentListResponse {
        agents: state.agents.clone(),
    })
}

#[utoipa::path(
    post,
    path = "/v1/threads",
    request_body = CreateThreadRequest,
    responses((status = 200, body = CreateThreadResponse), (status = 400, body = ErrorEnvelope)),
    tag = "threads"
)]
async fn create_thread(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientId>,
    body: Bytes,
) -> Result<Json<CreateThreadResponse>, ApiError> {
    let request: CreateThreadRequest = parse_json_body(&body)?;

    let agent = request.agent.trim().to_string();
    if !state.allowed_agents.contains(&agent) {
        let mut allowed: Vec<String> = state.allowed_agents.iter().cloned().collect();
        allowed.sort();
        return Err(HubError::invalid_argument("agent is not in allowlist")
            .with_detail("field", "agent")
            .with_detail("allowedAgents", Value::from(allowed))
            .into());
    }

    let cwd_raw = request.cwd.trim();
    if cwd_raw.is_empty() || !FsPath::new(cwd_raw).is_absolute() {
        return Err(HubError::invalid_argument("cwd must be an absolute path")
            .with_detail("field", "cwd")
            .into());
    }
    let cwd = clean_path(FsPath::new(cwd_raw));
    if !is_path_allowed(&cwd, &state.allowed_roots) {
        return Err(HubError::forbidden("cwd is outside allowed roots")
            .with_detail("field", "cwd")
            .with_detail("cwd", cwd.to_string_lossy().to_string())
            .into());
    }

    let agent_options_json = normalize_agent_options(request.agent_options.as_ref())?;

    let thread_id = new_thread_id();
    state
        .store
        .create_thread(CreateThreadParams {
            thread_id: thread_id.clone(),
            client_id: client.0,
            agent_id: agent,
            cwd: cwd.to_string_lossy().to_string(),
            title: request.title,
            agent_options_json,
            summary: String::new(),
        })
        .await
        .map_err(|err| HubError::internal(format!("failed to create thread: {err}")))?;

    Ok(Json(CreateThreadResponse { thread_id }))
}

#[utoipa::path(
    get,
    path = "/v1/threads",
    responses((status = 200, body = ThreadListResponse)),
    tag = "threads"
)]
async fn list_threads(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientId>,
) -> Result<Json<ThreadListResponse>, ApiError> {
    let threads = state
        .store
        .list_threads_by_client(&client.0)
        .await
        .map_err(|err| HubError::internal(format!("failed to list threads: {err}")))?;

    let mut items = Vec::with_capacity(threads.len());
    for thread in threads {
        items.push(thread_body(&thread)?);
    }
    Ok(Json(ThreadListResponse { threads: items }))
}

#[utoipa::path(
    get,
    path = "/v1/threads/{thread_id}",
    params(("thread_id" = String, Path, description = "Thread id")),
    responses((status = 200, body = ThreadResponse), (status = 404, body = ErrorEnvelope)),
    tag = "threads"
)]
async fn get_thread(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientId>,
    Path(thread_id): Path<String>,
) -> Result<Json<ThreadResponse>, ApiError> {
    let thread = owned_thread(&state, &client.0, &thread_id).await?;
    Ok(Json(ThreadResponse {
        thread: thread_body(&thread)?,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/threads/{thread_id}/turns",
    request_body = TurnRequest,
    params(("thread_id" = String, Path, description = "Thread id")),
    responses(
        (status = 200, description = "SSE event stream"),
        (status = 404, body = ErrorEnvelope),
        (status = 409, body = ErrorEnvelope),
        (status = 503, body = ErrorEnvelope)
    ),
    tag = "turns"
)]
async fn create_turn_stream(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientId>,
    Path(thread_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let thread = owned_thread(&state, &client.0, &thread_id).await?;

    let request: TurnRequest = parse_json_body(&body)?;
    if !request.stream {
        return Err(HubError::invalid_argument("stream must be true")
            .with_detail("field", "stream")
            .into());
    }

    let injected_prompt = build_injected_prompt(&state, &thread, &request.input).await?;

    let provider = state.agent_cache.resolve(&thread).await.map_err(|err| {
        HubError::upstream_unavailable("failed to resolve agent provider")
            .with_detail("agent", thread.agent_id.clone())
            .with_detail("reason", err.to_string())
    })?;

    let turn_id = new_turn_id();
    let cancel = CancellationToken::new();
    state
        .controller
        .activate(&thread.thread_id, &turn_id, cancel.clone())
        .map_err(|err| match err {
            TurnControllerError::ActiveTurnExists => {
                HubError::conflict("thread already has an active turn")
                    .with_detail("threadId", thread.thread_id.clone())
            }
            TurnControllerError::TurnNotActive => HubError::internal(err.to_string()),
        })?;

    if let Err(err) = state
        .store
        .create_turn(CreateTurnParams {
            turn_id: turn_id.clone(),
            thread_id: thread.thread_id.clone(),
            request_text: injected_prompt.clone(),
            status: "running".to_string(),
            is_internal: false,
        })
        .await
    {
        cancel.cancel();
        state.controller.release(&thread.thread_id, &turn_id);
        return Err(HubError::internal(format!("failed to create turn: {err}")).into());
    }

    let (frames_tx, frames_rx) = mpsc::channel(SSE_CHANNEL_CAPACITY);
    let task = TurnTask {
        store: state.store.clone(),
        permissions: state.permissions.clone(),
        controller: state.controller.clone(),
        provider,
        thread_id: thread.thread_id.clone(),
        turn_id: turn_id.clone(),
        client_id: client.0,
        cancel: cancel.clone(),
        frames: Some(frames_tx),
        compact: None,
    };
    tokio::spawn(task.run(injected_prompt));

    let stream = TurnEventStream::new(frames_rx, cancel);
    Ok(Sse::new(stream).into_response())
}

#[utoipa::path(
    post,
    path = "/v1/turns/{turn_id}/cancel",
    params(("turn_id" = String, Path, description = "Turn id")),
    responses(
        (status = 200, body = CancelTurnResponse),
        (status = 404, body = ErrorEnvelope),
        (status = 409, body = ErrorEnvelope)
    ),
    tag = "turns"
)]
async fn cancel_turn(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientId>,
    Path(turn_id): Path<String>,
) -> Result<Json<CancelTurnResponse>, ApiError> {
    let turn = match state.store.get_turn(&turn_id).await {
        Ok(turn) => turn,
        Err(StorageError::NotFound) => {
            return Err(HubError::not_found("turn not found").into());
        }
        Err(err) => {
            return Err(HubError::internal(format!("failed to load turn: {err}")).into());
        }
    };

    // Cross-client turns are indistinguishable from missing turns.
    let thread = owned_thread(&state, &client.0, &turn.thread_id)
        .await
        .map_err(|_| ApiError::from(HubError::not_found("turn not found")))?;

    state.controller.cancel(&turn_id).map_err(|err| match err {
        TurnControllerError::TurnNotActive => HubError::conflict("turn is not active")
            .with_detail("turnId", turn_id.clone()),
        TurnControllerError::ActiveTurnExists => HubError::internal(err.to_string()),
    })?;

    Ok(Json(CancelTurnResponse {
        turn_id,
        thread_id: thread.thread_id,
        status: "cancelling".to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/v1/threads/{thread_id}/history",
    params(
        ("thread_id" = String, Path, description = "Thread id"),
        ("includeEvents" = Option<String>, Query, description = "Include persisted event rows"),
        ("includeInternal" = Option<String>, Query, description = "Include internal turns")
    ),
    responses((status = 200, body = HistoryResponse), (status = 404, body = ErrorEnvelope)),
    tag = "turns"
)]
async fn thread_history(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientId>,
    Path(thread_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    owned_thread(&state, &client.0, &thread_id).await?;

    let include_events = query_flag(&query.include_events);
    let include_internal = query_flag(&query.include_internal);

    let turns = state
        .store
        .list_turns_by_thread(&thread_id)
        .await
        .map_err(|err| HubError::internal(format!("failed to list history: {err}")))?;

    let mut items = Vec::with_capacity(turns.len());
    for turn in turns {
        if !include_internal && turn.is_internal {
            continue;
        }

        let events = if include_events {
            let rows = state
                .store
                .list_events_by_turn(&turn.turn_id)
                .await
                .map_err(|err| HubError::internal(format!("failed to list events: {err}")))?;
            Some(
                rows.into_iter()
                    .map(|event| EventBody {
                        event_id: event.event_id,
                        seq: event.seq,
                        event_type: event.event_type,
                        data: serde_json::from_str(&event.data_json).unwrap_or_else(|_| json!({})),
                        created_at: format_time(event.created_at),
                    })
                    .collect(),
            )
        } else {
            None
        };

        items.push(TurnHistoryBody {
            turn_id: turn.turn_id,
            request_text: turn.request_text,
            response_text: turn.response_text,
            is_internal: turn.is_internal,
            status: turn.status,
            stop_reason: turn.stop_reason,
            error_message: turn.error_message,
            created_at: format_time(turn.created_at),
            completed_at: turn.completed_at.map(format_time),
            events,
        });
    }

    Ok(Json(HistoryResponse { turns: items }))
}

#[utoipa::path(
    post,
    path = "/v1/threads/{thread_id}/compact",
    request_body = CompactRequest,
    params(("thread_id" = String, Path, description = "Thread id")),
    responses(
        (status = 200, body = CompactResponse),
        (status = 404, body = ErrorEnvelope),
        (status = 503, body = ErrorEnvelope),
        (status = 504, body = ErrorEnvelope)
    ),
    tag = "turns"
)]
async fn compact_thread(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientId>,
    Path(thread_id): Path<String>,
    body: Bytes,
) -> Result<Json<CompactResponse>, ApiError> {
    let thread = owned_thread(&state, &client.0, &thread_id).await?;

    let request: CompactRequest = if body.is_empty() {
        CompactRequest::default()
    } else {
        parse_json_body(&body)?
    };
    let summary_limit = match request.max_summary_chars {
        Some(limit) if limit > 0 => limit,
        _ => state.compact_max_chars,
    };

    let provider = state.agent_cache.resolve(&thread).await.map_err(|err| {
        HubError::upstream_unavailable("failed to resolve agent provider")
            .with_detail("agent", thread.agent_id.clone())
            .with_detail("reason", err.to_string())
    })?;

    let instruction = compose::compact_instruction(summary_limit);
    let compact_prompt = build_injected_prompt(&state, &thread, &instruction).await?;

    let turn_id = new_turn_id();
    let cancel = CancellationToken::new();
    state
        .controller
        .activate(&thread.thread_id, &turn_id, cancel.clone())
        .map_err(|err| match err {
            TurnControllerError::ActiveTurnExists => {
                HubError::conflict("thread already has an active turn")
                    .with_detail("threadId", thread.thread_id.clone())
            }
            TurnControllerError::TurnNotActive => HubError::internal(err.to_string()),
        })?;

    if let Err(err) = state
        .store
        .create_turn(CreateTurnParams {
            turn_id: turn_id.clone(),
            thread_id: thread.thread_id.clone(),
            request_text: compact_prompt.clone(),
            status: "running".to_string(),
            is_internal: true,
        })
        .await
    {
        cancel.cancel();
        state.controller.release(&thread.thread_id, &turn_id);
        return Err(HubError::internal(format!("failed to create compact turn: {err}")).into());
    }

    let task = TurnTask {
        store: state.store.clone(),
        permissions: state.permissions.clone(),
        controller: state.controller.clone(),
        provider,
        thread_id: thread.thread_id.clone(),
        turn_id: turn_id.clone(),
        client_id: client.0,
        cancel,
        frames: None,
        compact: Some(CompactSpec {
            thread_id: thread.thread_id.clone(),
            summary_limit,
        }),
    };

    // The compact core runs detached from the connection so durable state
    // still closes out if the caller goes away mid-summary.
    let outcome = tokio::spawn(task.run(compact_prompt))
        .await
        .map_err(|err| HubError::internal(format!("compact turn task failed: {err}")))?;

    if outcome.status != "completed" {
        let code = outcome
            .stream_error
            .as_ref()
            .map(classify_stream_error)
            .unwrap_or(ErrorCode::Internal);
        let error = match code {
            ErrorCode::Timeout => HubError::timeout("compact failed"),
            ErrorCode::UpstreamUnavailable => HubError::upstream_unavailable("compact failed"),
            _ => HubError::internal("compact failed"),
        }
        .with_detail("turnId", turn_id)
        .with_detail("reason", outcome.error_message);
        return Err(error.into());
    }

    let summary_chars = compose::rune_len(&outcome.summary);
    Ok(Json(CompactResponse {
        thread_id: thread.thread_id,
        turn_id,
        status: outcome.status.to_string(),
        stop_reason: outcome.stop_reason.to_string(),
        summary: outcome.summary,
        summary_chars,
    }))
}

#[utoipa::path(
    post,
    path = "/v1/permissions/{permission_id}",
    request_body = PermissionDecisionRequest,
    params(("permission_id" = String, Path, description = "Permission id")),
    responses(
        (status = 200, body = PermissionDecisionResponse),
        (status = 400, body = ErrorEnvelope),
        (status = 404, body = ErrorEnvelope),
        (status = 409, body = ErrorEnvelope)
    ),
    tag = "permissions"
)]
async fn decide_permission(
    State(state): State<Arc<AppState>>,
    Extension(client): Extension<ClientId>,
    Path(permission_id): Path<String>,
    body: Bytes,
) -> Result<Json<PermissionDecisionResponse>, ApiError> {
    let request: PermissionDecisionRequest = parse_json_body(&body)?;
    let Some(outcome) = PermissionOutcome::parse(&request.outcome) else {
        return Err(
            HubError::invalid_argument("outcome must be approved, declined, or cancelled")
                .with_detail("field", "outcome")
                .into(),
        );
    };

    state
        .permissions
        .resolve(&permission_id, &client.0, outcome)
        .await
        .map_err(|err| match err {
            PermissionError::NotFound => HubError::not_found("permission not found"),
            PermissionError::AlreadyResolved => HubError::conflict("permission already resolved")
                .with_detail("permissionId", permission_id.clone()),
        })?;

    Ok(Json(PermissionDecisionResponse {
        permission_id,
        status: "recorded".to_string(),
        outcome: outcome.as_str().to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Turn pipeline

struct CompactSpec {
    thread_id: String,
    summary_limit: usize,
}

struct TurnOutcome {
    status: &'static str,
    stop_reason: &'static str,
    error_message: String,
    summary: String,
    stream_error: Option<HubError>,
}

struct TurnTask {
    store: Store,
    permissions: Arc<PermissionBroker>,
    controller: Arc<TurnController>,
    provider: Arc<dyn Streamer>,
    thread_id: String,
    turn_id: String,
    client_id: String,
    cancel: CancellationToken,
    frames: Option<mpsc::Sender<Event>>,
    compact: Option<CompactSpec>,
}

/// Releases the controller slot and fires the cancel token on every exit
/// path, unwinds included.
struct ReleaseGuard {
    controller: Arc<TurnController>,
    thread_id: String,
    turn_id: String,
    cancel: CancellationToken,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.controller.release(&self.thread_id, &self.turn_id);
    }
}

impl TurnTask {
    async fn run(self, prompt: String) -> TurnOutcome {
        let _guard = ReleaseGuard {
            controller: self.controller.clone(),
            thread_id: self.thread_id.clone(),
            turn_id: self.turn_id.clone(),
            cancel: self.cancel.clone(),
        };

        let emitter = TurnEmitter {
            store: self.store.clone(),
            turn_id: self.turn_id.clone(),
            frames: self.frames.clone(),
        };
        let bridge = Arc::new(PermissionBridge {
            broker: self.permissions.clone(),
            emitter: emitter.clone(),
            turn_id: self.turn_id.clone(),
            client_id: self.client_id.clone(),
            cancel: self.cancel.clone(),
        });
        let turn = TurnContext::new(self.cancel.clone()).with_permission_handler(bridge);
        let sink = TurnDeltaSink {
            emitter: emitter.clone(),
            turn_id: self.turn_id.clone(),
            buffer: Mutex::new(String::new()),
        };

        let mut status = "completed";
        let mut stop_reason: &'static str = StopReason::EndTurn.as_str();
        let mut error_message = String::new();
        let mut stream_error = None;

        if let Err(err) = emitter
            .emit("turn_started", json!({ "turnId": self.turn_id }))
            .await
        {
            status = "failed";
            stop_reason = "error";
            error_message = err.to_string();
            stream_error = Some(err);
        } else {
            match self.provider.stream(&turn, &prompt, &sink).await {
                Ok(StopReason::EndTurn) => {}
                Ok(StopReason::Cancelled) => {
                    status = "cancelled";
                    stop_reason = StopReason::Cancelled.as_str();
                }
                Err(err) => {
                    status = "failed";
                    stop_reason = "error";
                    error_message = err.to_string();
                    let _ = emitter
                        .emit(
                            "error",
                            json!({
                                "turnId": self.turn_id,
                                "code": classify_stream_error(&err).as_str(),
                                "message": err.to_string(),
                            }),
                        )
                        .await;
                    stream_error = Some(err);
                }
            }

            if let Err(err) = emitter
                .emit(
                    "turn_completed",
                    json!({ "turnId": self.turn_id, "stopReason": stop_reason }),
                )
                .await
            {
                if error_message.is_empty() {
                    error_message = err.to_string();
                    if status == "completed" {
                        status = "failed";
                        stop_reason = "error";
                    }
                }
            }
        }

        let response_text = sink.buffer.lock().await.clone();

        let mut summary = String::new();
        if let Some(compact) = &self.compact {
            summary = compose::clamp_to_chars(response_text.trim(), compact.summary_limit);
            if status == "completed" && stop_reason == StopReason::EndTurn.as_str() {
                if let Err(err) = self
                    .store
                    .update_thread_summary(&compact.thread_id, &summary)
                    .await
                {
                    status = "failed";
                    stop_reason = "error";
                    error_message = err.to_string();
                }
            }
        }

        if let Err(err) = self
            .store
            .finalize_turn(FinalizeTurnParams {
                turn_id: self.turn_id.clone(),
                response_text,
                status: status.to_string(),
                stop_reason: stop_reason.to_string(),
                error_message: error_message.clone(),
            })
            .await
        {
            tracing::error!(turn_id = %self.turn_id, error = %err, "failed to finalize turn");
        }

        TurnOutcome {
            status,
            stop_reason,
            error_message,
            summary,
            stream_error,
        }
    }
}

/// Persists each event, then mirrors it onto the SSE channel. Persistence is
/// independent of the connection; the SSE send fails fast once the client is
/// gone.
#[derive(Clone)]
struct TurnEmitter {
    store: Store,
    turn_id: String,
    frames: Option<mpsc::Sender<Event>>,
}

impl TurnEmitter {
    async fn emit(&self, event_type: &str, payload: Value) -> Result<(), HubError> {
        let data = serde_json::to_string(&payload)
            .map_err(|err| HubError::internal(format!("failed to encode event payload: {err}")))?;
        self.store
            .append_event(&self.turn_id, event_type, &data)
            .await
            .map_err(|err| HubError::internal(format!("failed to persist event: {err}")))?;

        if let Some(frames) = &self.frames {
            frames
                .send(sse::frame(event_type, &payload))
                .await
                .map_err(|_| HubError::internal("client event stream is closed"))?;
        }
        Ok(())
    }
}

struct TurnDeltaSink {
    emitter: TurnEmitter,
    turn_id: String,
    buffer: Mutex<String>,
}

#[async_trait]
impl DeltaSink for TurnDeltaSink {
    async fn delta(&self, chunk: &str) -> Result<(), HubError> {
        self.buffer.lock().await.push_str(chunk);
        self.emitter
            .emit(
                "message_delta",
                json!({ "turnId": self.turn_id, "delta": chunk }),
            )
            .await
    }
}

/// Per-turn permission handler: allocates the permission id, surfaces the
/// `permission_required` event, then blocks on the broker fail-closed.
struct PermissionBridge {
    broker: Arc<PermissionBroker>,
    emitter: TurnEmitter,
    turn_id: String,
    client_id: String,
    cancel: CancellationToken,
}

#[async_trait]
impl PermissionHandler for PermissionBridge {
    async fn request_permission(&self, request: PermissionRequest) -> PermissionResponse {
        let ticket = self
            .broker
            .register(&request.request_id, &self.client_id)
            .await;

        let payload = json!({
            "turnId": self.turn_id,
            "permissionId": ticket.permission_id,
            "approval": request.approval,
            "command": request.command,
            "requestId": request.request_id,
        });
        if self.emitter.emit("permission_required", payload).await.is_err() {
            ticket.resolve_declined();
            self.broker.remove(&ticket).await;
            return PermissionResponse {
                outcome: PermissionOutcome::Declined,
            };
        }

        let outcome = self.broker.wait(&ticket, &self.cancel).await;
        self.broker.remove(&ticket).await;
        PermissionResponse { outcome }
    }
}

// ---------------------------------------------------------------------------
// Helpers

async fn owned_thread(
    state: &AppState,
    client_id: &str,
    thread_id: &str,
) -> Result<Thread, ApiError> {
    let thread = match state.store.get_thread(thread_id).await {
        Ok(thread) => thread,
        Err(StorageError::NotFound) => {
            return Err(HubError::not_found("thread not found").into());
        }
        Err(err) => {
            return Err(HubError::internal(format!("failed to load thread: {err}")).into());
        }
    };
    // Cross-client reads are indistinguishable from missing threads.
    if thread.client_id != client_id {
        return Err(HubError::not_found("thread not found").into());
    }
    Ok(thread)
}

async fn build_injected_prompt(
    state: &AppState,
    thread: &Thread,
    current_input: &str,
) -> Result<String, ApiError> {
    let recent = load_recent_visible_turns(state, &thread.thread_id).await?;
    Ok(compose::compose_context_prompt(
        &thread.summary,
        &recent,
        current_input,
        state.context_max_chars,
    ))
}

async fn load_recent_visible_turns(
    state: &AppState,
    thread_id: &str,
) -> Result<Vec<Turn>, ApiError> {
    let turns = state
        .store
        .list_turns_by_thread(thread_id)
        .await
        .map_err(|err| {
            ApiError::from(HubError::internal(format!(
                "failed to load recent turns: {err}"
            )))
        })?;

    let mut visible: Vec<Turn> = turns.into_iter().filter(|turn| !turn.is_internal).collect();
    if visible.len() > state.context_recent_turns {
        visible = visible.split_off(visible.len() - state.context_recent_turns);
    }
    Ok(visible)
}

fn classify_stream_error(err: &HubError) -> ErrorCode {
    match err.code() {
        ErrorCode::Timeout => ErrorCode::Timeout,
        _ => ErrorCode::UpstreamUnavailable,
    }
}

fn thread_body(thread: &Thread) -> Result<ThreadBody, ApiError> {
    let raw = if thread.agent_options_json.trim().is_empty() {
        "{}"
    } else {
        thread.agent_options_json.as_str()
    };
    let agent_options: Value = serde_json::from_str(raw).map_err(|_| {
        ApiError::from(HubError::internal(format!(
            "invalid agent_options_json for thread {}",
            thread.thread_id
        )))
    })?;

    Ok(ThreadBody {
        thread_id: thread.thread_id.clone(),
        agent: thread.agent_id.clone(),
        cwd: thread.cwd.clone(),
        title: thread.title.clone(),
        agent_options,
        summary: thread.summary.clone(),
        created_at: format_time(thread.created_at),
        updated_at: format_time(thread.updated_at),
    })
}

fn normalize_agent_options(raw: Option<&Value>) -> Result<String, HubError> {
    match raw {
        None | Some(Value::Null) => Ok("{}".to_string()),
        Some(Value::Object(map)) => serde_json::to_string(map)
            .map_err(|err| HubError::internal(format!("failed to encode agentOptions: {err}"))),
        Some(_) => Err(HubError::invalid_argument("agentOptions must be a JSON object")
            .with_detail("field", "agentOptions")),
    }
}

fn parse_json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, HubError> {
    serde_json::from_slice(body).map_err(|err| {
        HubError::invalid_argument("invalid JSON body").with_detail("reason", err.to_string())
    })
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn query_flag(value: &Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::trim).map(str::to_ascii_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn new_thread_id() -> String {
    format!("th_{}", Uuid::new_v4().simple())
}

fn new_turn_id() -> String {
    format!("tu_{}", Uuid::new_v4().simple())
}

/// Lexically normalizes a path: removes `.`, resolves `..` without touching
/// the filesystem.
fn clean_path(path: &FsPath) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => cleaned.push(component.as_os_str()),
            Component::Prefix(prefix) => cleaned.push(prefix.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            Component::Normal(part) => cleaned.push(part),
        }
    }
    if cleaned.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        cleaned
    }
}

fn is_path_allowed(path: &FsPath, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}
