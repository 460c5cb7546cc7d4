//! Streamable HTTP transport: POST dispatches JSON-RPC bodies, GET opens a
//! resumable SSE stream, DELETE closes the session.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use buildspace_core::errors::ProtocolError;
use buildspace_core::ids::SessionId;
use buildspace_core::rpc::{contains_initialize_request, is_initialize_request};
use buildspace_engine::tools::{create_learning_registry, create_repository_registry};
use buildspace_engine::{
    Conversation, EngineError, PlanSource, ServerInfo, ToolRegistry, WorkspaceAcquirer,
};
use buildspace_store::{EventLog, Subscription};
use futures::stream::{self, Stream};
use serde_json::{json, Value};

use crate::session::{Session, SessionRegistry, StreamGuard};

pub const SESSION_HEADER: &str = "mcp-session-id";
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub const LEARNING_SERVER_NAME: &str = "buildspace";
pub const REPOSITORY_SERVER_NAME: &str = "repo-analyzer";

/// Which tool set sessions on this gateway get.
#[derive(Clone)]
pub enum Toolset {
    /// Plan tools; each session is bound to the plan id in its initialize path.
    Learning(Arc<dyn PlanSource>),
    Repository(Arc<WorkspaceAcquirer>),
}

/// Gateway flavour plus the identity it announces to clients.
#[derive(Clone)]
pub struct Gateway {
    pub toolset: Toolset,
    pub info: ServerInfo,
}

impl Gateway {
    pub fn learning(source: Arc<dyn PlanSource>) -> Self {
        Self {
            toolset: Toolset::Learning(source),
            info: ServerInfo::new(LEARNING_SERVER_NAME, env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn repository(acquirer: Arc<WorkspaceAcquirer>) -> Self {
        Self {
            toolset: Toolset::Repository(acquirer),
            info: ServerInfo::new(REPOSITORY_SERVER_NAME, env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn is_learning(&self) -> bool {
        matches!(self.toolset, Toolset::Learning(_))
    }

    fn build_registry(&self, plan_id: Option<&str>) -> ToolRegistry {
        match &self.toolset {
            Toolset::Learning(source) => {
                create_learning_registry(plan_id.unwrap_or_default(), Arc::clone(source))
            }
            Toolset::Repository(acquirer) => create_repository_registry(Arc::clone(acquirer)),
        }
    }
}

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub sessions: Arc<SessionRegistry>,
    /// How long a session survives with no open stream after a disconnect.
    pub disconnect_grace: Duration,
}

fn rpc_error(status: StatusCode, err: ProtocolError) -> Response {
    (status, Json(err.to_response(Value::Null))).into_response()
}

fn invalid_session() -> Response {
    rpc_error(StatusCode::BAD_REQUEST, ProtocolError::InvalidSession)
}

/// What the `mcp-session-id` header carried.
#[derive(Debug, PartialEq, Eq)]
enum SessionHeader {
    Absent,
    /// Present but blank or not visible ASCII; never names a session.
    Malformed,
    Valid(SessionId),
}

fn session_header(headers: &HeaderMap) -> SessionHeader {
    let Some(value) = headers.get(SESSION_HEADER) else {
        return SessionHeader::Absent;
    };
    match value.to_str().map(str::trim) {
        Ok(id) if !id.is_empty() => SessionHeader::Valid(SessionId::from_raw(id)),
        _ => SessionHeader::Malformed,
    }
}

fn session_id_from(headers: &HeaderMap) -> Option<SessionId> {
    match session_header(headers) {
        SessionHeader::Valid(id) => Some(id),
        SessionHeader::Absent | SessionHeader::Malformed => None,
    }
}

fn parse_last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn lookup(state: &AppState, headers: &HeaderMap) -> Option<Arc<Session>> {
    session_id_from(headers).and_then(|id| state.sessions.get(&id))
}

pub async fn post_learning(
    State(state): State<AppState>,
    Path(plan_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(&state, Some(plan_id), &headers, &body).await
}

pub async fn post_repository(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(&state, None, &headers, &body).await
}

async fn dispatch(
    state: &AppState,
    plan_id: Option<String>,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    let body: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "Unparseable request body");
            return rpc_error(StatusCode::BAD_REQUEST, ProtocolError::Parse);
        }
    };

    let session_id = match session_header(headers) {
        SessionHeader::Valid(id) => id,
        SessionHeader::Absent if is_initialize_request(&body) => {
            return initialize_session(state, plan_id, body).await;
        }
        SessionHeader::Absent => return invalid_session(),
        SessionHeader::Malformed => {
            tracing::debug!("Malformed session header");
            return invalid_session();
        }
    };

    let Some(session) = state.sessions.get(&session_id) else {
        tracing::debug!(session_id = %session_id, "Request for unknown session");
        return invalid_session();
    };
    if contains_initialize_request(&body) {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            ProtocolError::InvalidRequest("Server already initialized".into()),
        );
    }

    session.touch();
    match session.conversation.handle_body(body).await {
        Ok(Some(reply)) => Json(reply).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(EngineError::Closed) => {
            tracing::debug!(session_id = %session_id, "Request raced session close");
            invalid_session()
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Session failed, tearing down");
            state.sessions.remove(&session_id);
            rpc_error(StatusCode::INTERNAL_SERVER_ERROR, ProtocolError::Internal)
        }
    }
}

async fn initialize_session(state: &AppState, plan_id: Option<String>, body: Value) -> Response {
    let session_id = SessionId::new();
    let events = Arc::new(EventLog::new(session_id.clone()));
    let registry = state.gateway.build_registry(plan_id.as_deref());
    let conversation = Conversation::new(state.gateway.info.clone(), Arc::new(registry), events);

    let reply = match conversation.handle_body(body).await {
        Ok(Some(reply)) => reply,
        Ok(None) => return StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Initialize failed");
            conversation.close();
            return rpc_error(StatusCode::INTERNAL_SERVER_ERROR, ProtocolError::Internal);
        }
    };

    if !conversation.is_initialized() {
        conversation.close();
        return Json(reply).into_response();
    }

    let session = state.sessions.create(conversation);
    tracing::info!(
        session_id = %session.id,
        plan_id = plan_id.as_deref().unwrap_or(""),
        sessions = state.sessions.count(),
        "Session initialized"
    );

    let mut response = Json(reply).into_response();
    match HeaderValue::from_str(session.id.as_str()) {
        Ok(value) => {
            response.headers_mut().insert(SESSION_HEADER, value);
            response
        }
        Err(_) => {
            state.sessions.remove(&session.id);
            rpc_error(StatusCode::INTERNAL_SERVER_ERROR, ProtocolError::Internal)
        }
    }
}

/// GET: server-to-client event stream with `Last-Event-ID` resumption.
pub async fn open_stream(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session) = lookup(&state, &headers) else {
        return invalid_session();
    };

    let after = parse_last_event_id(&headers);
    let subscription = session.conversation.events().subscribe(after);
    tracing::info!(
        session_id = %session.id,
        last_event_id = ?after,
        "SSE stream opened"
    );

    let guard = state.sessions.stream_opened(&session, state.disconnect_grace);
    Sse::new(event_stream(subscription, guard))
        .keep_alive(
            KeepAlive::new()
                .interval(KEEP_ALIVE_INTERVAL)
                .text("keep-alive"),
        )
        .into_response()
}

fn event_stream(
    subscription: Subscription,
    guard: StreamGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((subscription, guard), |(mut subscription, guard)| async move {
        let entry = subscription.next().await?;
        let event = Event::default()
            .id(entry.sequence.to_string())
            .event("message")
            .data(entry.payload.to_string());
        Some((Ok(event), (subscription, guard)))
    })
}

/// DELETE: close the session named by the header.
pub async fn close_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_id_from(&headers) else {
        return invalid_session();
    };
    match state.sessions.remove(&session_id) {
        Some(_) => {
            tracing::info!(
                session_id = %session_id,
                sessions = state.sessions.count(),
                "Session closed"
            );
            StatusCode::OK.into_response()
        }
        None => invalid_session(),
    }
}

pub async fn health(State(state): State<AppState>) -> Response {
    if state.gateway.is_learning() {
        Json(json!({
            "status": "ok",
            "server": state.gateway.info.name,
            "version": state.gateway.info.version,
        }))
        .into_response()
    } else {
        "OK".into_response()
    }
}
