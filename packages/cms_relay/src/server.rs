//! Server assembly: routes, listener binding, background tasks and shutdown.

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::AgentFactory;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::state::RelayState;
use crate::ws::{handle_relay_ws, spawn_heartbeat};

/// Span maker that tags each upgrade request with a unique id
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, agents: Arc<dyn AgentFactory>) -> Self {
        Self {
            state: Arc::new(RelayState::new(config, agents)),
        }
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// WebSocket upgrade on both `/` and `/ws`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_upgrade))
            .route("/ws", get(ws_upgrade))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan)),
            )
            .with_state(self.state.clone())
    }

    /// Spawn the heartbeat monitor and the session sweeper.
    pub fn start_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let cancel = self.state.shutdown_token();
        let config = &self.state.config;
        vec![
            spawn_heartbeat(
                self.state.clone(),
                config.websocket.heartbeat_interval,
                cancel.clone(),
            ),
            self.state
                .sessions
                .spawn_sweeper(config.session.sweep_interval, cancel),
        ]
    }

    /// Serve until `shutdown` resolves, then close every connection
    /// (preserving sessions) and stop the background tasks.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tasks = self.start_background_tasks();
        let state = self.state.clone();
        let app = self.router();

        if let Ok(addr) = listener.local_addr() {
            info!("CMS relay listening on ws://{}", addr);
        }

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("Received shutdown signal, closing connections...");
                state.shutdown().await;
            })
            .await;

        self.state.shutdown_token().cancel();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        let snapshot = self.state.metrics.snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(json) => info!(metrics = %json, "Shutdown complete"),
            Err(_) => info!("Shutdown complete"),
        }
        result.map_err(RelayError::Io)
    }
}

async fn ws_upgrade(State(state): State<Arc<RelayState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_relay_ws(socket, state))
}

/// Bind `addr`, reporting an occupied port as [`RelayError::PortInUse`].
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, RelayError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::from_bind(addr, e))
}

/// Bind the first free address, moving on only when a port is taken.
pub async fn bind_first(addrs: &[SocketAddr]) -> Result<TcpListener, RelayError> {
    let mut last_err = None;
    for &addr in addrs {
        match bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.is_port_in_use() => {
                warn!("Port {} in use, trying next", addr.port());
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        RelayError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "no address to bind",
        ))
    }))
}
