//! Relay state
//!
//! Everything one relay instance owns: connections, sessions, the document
//! selection, and the agent factory. Nothing here is global, so several
//! relays can run side by side in one process.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentFactory;
use crate::config::RelayConfig;
use crate::metrics::ServerMetrics;
use crate::selection::SelectionTracker;
use crate::session::SessionStore;
use crate::ws::protocol::{OutboundFrame, ServerMessage, SessionInfo};
use crate::ws::registry::{Connection, ConnectionRegistry, Delivery, Outbound};

pub struct RelayState {
    pub registry: ConnectionRegistry,
    pub sessions: Arc<SessionStore>,
    pub selection: SelectionTracker,
    pub agents: Arc<dyn AgentFactory>,
    pub config: RelayConfig,
    pub metrics: Arc<ServerMetrics>,
    shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(config: RelayConfig, agents: Arc<dyn AgentFactory>) -> Self {
        let metrics = Arc::new(ServerMetrics::new());
        Self {
            registry: ConnectionRegistry::new(),
            sessions: Arc::new(SessionStore::new(config.session.expiry, metrics.clone())),
            selection: SelectionTracker::new(config.selection.max_documents),
            agents,
            config,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelled when the relay shuts down; background and delayed tasks watch it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a connection whose frames will be written from `tx`'s receiver.
    pub async fn register_connection(&self, tx: mpsc::Sender<Outbound>) -> Arc<Connection> {
        let agent = self.agents.create();
        let conn = self.registry.register(tx, agent).await;
        self.metrics.connection_opened();
        let active = self.registry.len().await;
        info!(
            conn_id = %conn.id(),
            tools = conn.agent().tools().len(),
            active,
            "Connection registered"
        );
        conn
    }

    /// Remove a connection and hand its agent state to the session store.
    ///
    /// Safe to call from both the close path and the heartbeat; only the
    /// first call does anything. Returns whether this call removed it.
    pub async fn remove_connection(&self, connection_id: &str) -> bool {
        // Registry and session store are separate critical sections
        let Some(conn) = self.registry.remove(connection_id).await else {
            debug!(conn_id = %connection_id, "Connection already removed");
            return false;
        };
        conn.close();
        self.metrics.connection_closed();

        if let Some(session_id) = self.preserve_connection_session(&conn).await {
            info!(conn_id = %connection_id, session = %session_id, "Connection removed, session preserved");
        } else {
            info!(conn_id = %connection_id, "Connection removed");
        }
        true
    }

    /// Snapshot the connection's agent into its session, if it has one.
    pub async fn preserve_connection_session(&self, conn: &Connection) -> Option<String> {
        let session_id = conn.session_id().await?;
        let snapshot = conn.agent().state().await;
        self.sessions.preserve(&session_id, snapshot, conn.id()).await;
        Some(session_id)
    }

    /// Queue a frame for one connection, recording the outcome.
    pub fn deliver(&self, conn: &Connection, frame: impl Into<OutboundFrame>) -> Delivery {
        let frame = frame.into();
        let kind = frame.message.kind();
        let delivery = conn.send(frame);
        match delivery {
            Delivery::Queued => self.metrics.frame_sent(),
            Delivery::Full => {
                self.metrics.frame_dropped();
                warn!(conn_id = %conn.id(), kind, "Outbound queue full, dropping frame");
            }
            Delivery::Closed => {
                debug!(conn_id = %conn.id(), kind, "Connection closed, frame not delivered");
            }
        }
        delivery
    }

    /// Send to every connection that is still open. Closed ones are skipped;
    /// cleaning them up is the heartbeat's and close handler's job.
    pub async fn broadcast(&self, message: ServerMessage) -> usize {
        let mut delivered = 0;
        for conn in self.registry.snapshot().await {
            if !conn.is_open() {
                continue;
            }
            if self.deliver(&conn, message.clone()) == Delivery::Queued {
                delivered += 1;
            }
        }
        debug!(kind = message.kind(), delivered, "Broadcast sent");
        delivered
    }

    /// The connection's session id, minting one on first use.
    /// Returns `(session_id, created)`.
    pub async fn ensure_session(&self, conn: &Connection) -> (String, bool) {
        if let Some(id) = conn.session_id().await {
            return (id, false);
        }
        let id = uuid::Uuid::new_v4().to_string();
        conn.set_session_id(id.clone()).await;
        self.metrics.session_created();
        info!(conn_id = %conn.id(), session = %id, "New session created");
        (id, true)
    }

    /// Session metadata as sent to clients.
    pub async fn session_info(&self, session_id: &str, reconnected: Option<bool>) -> SessionInfo {
        let last_activity = self
            .sessions
            .restore(session_id)
            .await
            .map(|s| s.last_active_at)
            .unwrap_or_else(Utc::now);
        SessionInfo {
            id: session_id.to_string(),
            last_activity,
            reconnected,
        }
    }

    /// Stop background work and close every connection, preserving sessions.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let connections = self.registry.snapshot().await;
        let count = connections.len();
        for conn in connections {
            self.remove_connection(conn.id()).await;
        }
        info!("Closed {} connections for shutdown", count);
    }
}
