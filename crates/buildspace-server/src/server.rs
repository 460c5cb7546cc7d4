use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::gateway::{self, AppState, Gateway};
use crate::session::{self, SessionRegistry};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Sessions idle this long without an open stream are closed.
    pub session_idle_timeout: Duration,
    pub reap_interval: Duration,
    /// A session whose last stream dropped is closed after this long unless
    /// the client reconnects or sends a request.
    pub disconnect_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            session_idle_timeout: Duration::from_secs(30 * 60),
            reap_interval: Duration::from_secs(60),
            disconnect_grace: Duration::from_secs(30),
        }
    }
}

/// Build the Axum router for a gateway.
pub fn build_router(state: AppState) -> Router {
    let mcp = if state.gateway.is_learning() {
        Router::new().route(
            "/mcp/{plan_id}",
            get(gateway::open_stream)
                .post(gateway::post_learning)
                .delete(gateway::close_session),
        )
    } else {
        Router::new().route(
            "/mcp",
            get(gateway::open_stream)
                .post(gateway::post_repository)
                .delete(gateway::close_session),
        )
    };

    mcp.route("/health", get(gateway::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle to shut the server down.
pub async fn start(config: ServerConfig, gateway: Gateway) -> Result<ServerHandle, std::io::Error> {
    let sessions = Arc::new(SessionRegistry::new());
    let shutdown = CancellationToken::new();

    let server_name = gateway.info.name.clone();
    let state = AppState {
        gateway: Arc::new(gateway),
        sessions: Arc::clone(&sessions),
        disconnect_grace: config.disconnect_grace,
    };
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        server = %server_name,
        port = local_addr.port(),
        "MCP gateway listening"
    );

    let reaper = session::start_reaper_task(
        Arc::clone(&sessions),
        config.reap_interval,
        config.session_idle_timeout,
        shutdown.clone(),
    );

    let graceful = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(graceful.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "Server stopped with error");
        }
    });

    Ok(ServerHandle {
        local_addr,
        sessions,
        shutdown,
        server,
        reaper,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    pub sessions: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    reaper: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Close every session (ending open streams), then stop accepting
    /// connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        let closed = self.sessions.close_all();
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::error!(error = %e, "Server task failed");
        }
        if let Err(e) = self.reaper.await {
            tracing::error!(error = %e, "Session reaper task failed");
        }
        tracing::info!(closed_sessions = closed, "MCP gateway stopped");
    }
}
