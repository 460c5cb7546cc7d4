//! MCP server side of a single session.
//!
//! A [`Conversation`] owns the session's tool registry and event log. It
//! turns inbound JSON-RPC messages into responses and records every outbound
//! message in the log before handing it back to the transport.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use buildspace_core::errors::ProtocolError;
use buildspace_core::ids::SessionId;
use buildspace_core::rpc::{
    methods, IncomingMessage, LogLevel, RpcNotification, RpcRequest, RpcResponse,
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use buildspace_core::tools::{ToolContext, ToolError, ToolNotifier, ToolResult};
use buildspace_store::EventLog;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::EngineError;
use crate::registry::ToolRegistry;

/// Name and version announced in the `initialize` result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Routes tool log messages into the session's event log as
/// `notifications/message`, honouring the client's `logging/setLevel`.
struct SessionNotifier {
    events: Arc<EventLog>,
    logger: String,
    min_level: RwLock<LogLevel>,
}

impl ToolNotifier for SessionNotifier {
    fn log(&self, level: LogLevel, message: &str) {
        if level < *self.min_level.read() {
            return;
        }
        let notification = RpcNotification::new(
            methods::LOG_MESSAGE,
            Some(json!({ "level": level, "logger": self.logger, "data": message })),
        );
        if let Err(e) = self.events.append_message(&notification) {
            tracing::error!(session_id = %self.events.session_id(), error = %e, "Failed to record log notification");
        }
    }
}

/// Requests currently inside `handle_body`, and whether a close is pending.
#[derive(Default)]
struct Lifecycle {
    in_flight: usize,
    closing: bool,
}

/// Held for the duration of one `handle_body` call. The last request to leave
/// a closing conversation releases the event log.
struct InFlight<'a> {
    conversation: &'a Conversation,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.conversation.lifecycle.lock();
        state.in_flight -= 1;
        if state.closing && state.in_flight == 0 {
            self.conversation.events.close();
        }
    }
}

pub struct Conversation {
    session_id: SessionId,
    info: ServerInfo,
    registry: Arc<ToolRegistry>,
    events: Arc<EventLog>,
    notifier: Arc<SessionNotifier>,
    cancel: CancellationToken,
    initialized: AtomicBool,
    client_ready: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl Conversation {
    pub fn new(info: ServerInfo, registry: Arc<ToolRegistry>, events: Arc<EventLog>) -> Self {
        let notifier = Arc::new(SessionNotifier {
            events: Arc::clone(&events),
            logger: info.name.clone(),
            min_level: RwLock::new(LogLevel::Info),
        });
        Self {
            session_id: events.session_id().clone(),
            info,
            registry,
            events,
            notifier,
            cancel: CancellationToken::new(),
            initialized: AtomicBool::new(false),
            client_ready: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// True once the client sent `notifications/initialized`.
    pub fn is_client_ready(&self) -> bool {
        self.client_ready.load(Ordering::Acquire)
    }

    pub fn log_level(&self) -> LogLevel {
        *self.notifier.min_level.read()
    }

    fn enter(&self) -> Result<InFlight<'_>, EngineError> {
        let mut state = self.lifecycle.lock();
        if state.closing {
            return Err(EngineError::Closed);
        }
        state.in_flight += 1;
        Ok(InFlight { conversation: self })
    }

    /// Process a POST body (single message or batch). Returns the JSON to
    /// send back, or `None` when the body held no requests.
    ///
    /// A body that arrives after `close()` gets `EngineError::Closed`. A body
    /// already being processed when `close()` runs still completes and its
    /// responses are recorded before the event log is released.
    #[instrument(skip(self, body), fields(session_id = %self.session_id))]
    pub async fn handle_body(&self, body: Value) -> Result<Option<Value>, EngineError> {
        let _in_flight = self.enter()?;
        match body {
            Value::Array(items) => {
                if items.is_empty() {
                    let response = ProtocolError::InvalidRequest("empty batch".into())
                        .to_response(Value::Null);
                    self.record(&response)?;
                    return Ok(Some(serde_json::to_value(response).map_err(store_err)?));
                }
                let mut responses = Vec::new();
                for item in items {
                    if let Some(response) = self.handle_message(item).await? {
                        responses.push(response);
                    }
                }
                if responses.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(serde_json::to_value(responses).map_err(store_err)?))
                }
            }
            single => match self.handle_message(single).await? {
                Some(response) => Ok(Some(serde_json::to_value(response).map_err(store_err)?)),
                None => Ok(None),
            },
        }
    }

    /// Handle one message. Responses are appended to the event log before
    /// they are returned.
    async fn handle_message(&self, value: Value) -> Result<Option<RpcResponse>, EngineError> {
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        let response = match IncomingMessage::parse(value) {
            Err(e) => e.to_response(id),
            Ok(IncomingMessage::Request(request)) => self.handle_request(request).await,
            Ok(IncomingMessage::Notification(notification)) => {
                self.handle_notification(&notification);
                return Ok(None);
            }
            Ok(IncomingMessage::Response(_)) => {
                tracing::debug!("Ignoring client response");
                return Ok(None);
            }
        };

        self.record(&response)?;
        Ok(Some(response))
    }

    fn record(&self, response: &RpcResponse) -> Result<u64, EngineError> {
        self.events.append_message(response).map_err(|e| {
            tracing::error!(session_id = %self.session_id, error = %e, "Event log rejected response");
            EngineError::Store(e)
        })
    }

    async fn handle_request(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest { id, method, params } = request;
        let params = params.unwrap_or(Value::Null);

        let outcome = match method.as_str() {
            methods::INITIALIZE => self.initialize(&params),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => Ok(json!({ "tools": self.registry.definitions() })),
            methods::TOOLS_CALL => self.call_tool(&params).await,
            methods::LOGGING_SET_LEVEL => self.set_level(&params),
            other => Err(ProtocolError::MethodNotFound(other.to_string())),
        };

        match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(e) => {
                tracing::debug!(method = %method, error = %e, "Request rejected");
                e.to_response(id)
            }
        }
    }

    fn handle_notification(&self, notification: &RpcNotification) {
        match notification.method.as_str() {
            methods::INITIALIZED => {
                self.client_ready.store(true, Ordering::Release);
                tracing::debug!(session_id = %self.session_id, "Client ready");
            }
            methods::CANCELLED => {
                tracing::debug!(session_id = %self.session_id, params = ?notification.params, "Client cancelled a request");
            }
            other => tracing::debug!(method = other, "Ignoring notification"),
        }
    }

    fn initialize(&self, params: &Value) -> Result<Value, ProtocolError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(ProtocolError::InvalidRequest("Server already initialized".into()));
        }

        let requested = params.get("protocolVersion").and_then(Value::as_str);
        let version = requested
            .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
            .unwrap_or(LATEST_PROTOCOL_VERSION);

        Ok(json!({
            "protocolVersion": version,
            "capabilities": {
                "tools": { "listChanged": false },
                "logging": {}
            },
            "serverInfo": {
                "name": self.info.name,
                "version": self.info.version
            }
        }))
    }

    fn set_level(&self, params: &Value) -> Result<Value, ProtocolError> {
        let level = params
            .get("level")
            .cloned()
            .ok_or_else(|| ProtocolError::InvalidParams("level is required".into()))
            .and_then(|v| {
                serde_json::from_value::<LogLevel>(v)
                    .map_err(|e| ProtocolError::InvalidParams(e.to_string()))
            })?;
        *self.notifier.min_level.write() = level;
        Ok(json!({}))
    }

    async fn call_tool(&self, params: &Value) -> Result<Value, ProtocolError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::InvalidParams("name is required".into()))?;
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let Some(tool) = self.registry.get(name) else {
            tracing::warn!(session_id = %self.session_id, tool = name, "Unknown tool requested");
            return Ok(render_tool_result(&ToolResult::error(format!("Tool not found: {name}"))));
        };

        let ctx = ToolContext {
            session_id: self.session_id.clone(),
            abort_signal: self.cancel.child_token(),
            notifier: Arc::clone(&self.notifier) as Arc<dyn ToolNotifier>,
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(tool.execute(args, &ctx))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ToolResult::error(tool_error_text(&e)),
            Err(_) => {
                tracing::error!(session_id = %self.session_id, tool = name, "Tool panicked");
                ToolResult::error(format!("Tool {name} failed unexpectedly"))
            }
        };

        tracing::info!(
            session_id = %self.session_id,
            tool = name,
            duration_ms = started.elapsed().as_millis() as u64,
            is_error = result.is_error,
            "Tool executed"
        );
        Ok(render_tool_result(&result))
    }

    /// Cancel in-flight tool work and release the event log once requests
    /// already being handled have recorded their responses. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        let mut state = self.lifecycle.lock();
        state.closing = true;
        if state.in_flight == 0 {
            self.events.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

fn tool_error_text(err: &ToolError) -> String {
    match err {
        ToolError::InvalidArguments(msg) => format!("Invalid arguments: {msg}"),
        ToolError::ExecutionFailed(msg) => msg.clone(),
        ToolError::Timeout(d) => format!("Tool timed out after {}s", d.as_secs()),
        ToolError::Cancelled => "Tool execution cancelled".to_string(),
    }
}

fn render_tool_result(result: &ToolResult) -> Value {
    json!({
        "content": [{ "type": "text", "text": result.content }],
        "isError": result.is_error
    })
}

fn store_err(e: serde_json::Error) -> EngineError {
    EngineError::Store(e.into())
}
