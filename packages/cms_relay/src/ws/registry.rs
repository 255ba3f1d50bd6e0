//! Connection Registry
//!
//! Owns one [`Connection`] record per live socket. The socket itself stays
//! with its handler task; the record carries the outbound queue, liveness
//! flags, and the cancellation token used to force a close.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;

use super::protocol::{HeartbeatPayload, OutboundFrame};

/// What the writer task puts on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(OutboundFrame),
    /// Heartbeat probe: a protocol-level ping plus a JSON `ping` frame
    Ping(HeartbeatPayload),
}

/// Result of queueing a frame for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Outbound queue full; the frame was dropped
    Full,
    /// Writer gone or connection cancelled
    Closed,
}

/// One live transport connection.
pub struct Connection {
    id: String,
    session_id: RwLock<Option<String>>,
    /// Milliseconds since the Unix epoch
    last_active_at: AtomicI64,
    /// Cleared before each heartbeat ping, set again by a pong
    is_alive: AtomicBool,
    reconnect_attempts: AtomicU32,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    agent: Arc<dyn Agent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("is_alive", &self.is_alive())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn new(id: String, tx: mpsc::Sender<Outbound>, agent: Arc<dyn Agent>) -> Self {
        Self {
            id,
            session_id: RwLock::new(None),
            last_active_at: AtomicI64::new(Utc::now().timestamp_millis()),
            is_alive: AtomicBool::new(true),
            reconnect_attempts: AtomicU32::new(0),
            tx,
            cancel: CancellationToken::new(),
            agent,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    pub async fn set_session_id(&self, session_id: String) {
        *self.session_id.write().await = Some(session_id);
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.last_active_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_active_at.load(Ordering::Relaxed))
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire)
    }

    /// A pong arrived.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Release);
    }

    /// Enter the pending-pong state. Returns whether the connection had
    /// answered since the previous probe.
    pub fn mark_pending(&self) -> bool {
        self.is_alive.swap(false, Ordering::AcqRel)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Count one more recoverable socket error; returns the new total.
    pub fn record_reconnect_attempt(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    /// Force the connection's handler to shut the socket.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queue a frame without waiting on a slow client.
    pub fn send(&self, frame: impl Into<OutboundFrame>) -> Delivery {
        self.enqueue(Outbound::Frame(frame.into()))
    }

    pub fn send_ping(&self, payload: HeartbeatPayload) -> Delivery {
        self.enqueue(Outbound::Ping(payload))
    }

    fn enqueue(&self, item: Outbound) -> Delivery {
        if self.cancel.is_cancelled() {
            return Delivery::Closed;
        }
        match self.tx.try_send(item) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// All live connections, keyed by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection under a fresh id.
    pub async fn register(
        &self,
        tx: mpsc::Sender<Outbound>,
        agent: Arc<dyn Agent>,
    ) -> Arc<Connection> {
        let mut connections = self.connections.write().await;
        let mut id = uuid::Uuid::new_v4().to_string();
        while connections.contains_key(&id) {
            id = uuid::Uuid::new_v4().to_string();
        }
        let conn = Arc::new(Connection::new(id.clone(), tx, agent));
        connections.insert(id, conn.clone());
        conn
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Stop tracking `id`. Only the first call for an id returns the record.
    pub async fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(id)
    }

    /// Every registered connection at this instant.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EchoAgent;
    use crate::ws::protocol::ServerMessage;
    use std::collections::HashSet;

    fn agent() -> Arc<dyn Agent> {
        Arc::new(EchoAgent::new())
    }

    #[tokio::test]
    async fn test_register_assigns_unique_ids() {
        let registry = ConnectionRegistry::new();
        let mut ids = HashSet::new();
        for _ in 0..50 {
            let (tx, _rx) = mpsc::channel(4);
            let conn = registry.register(tx, agent()).await;
            assert!(ids.insert(conn.id().to_string()));
        }
        assert_eq!(registry.len().await, 50);
    }

    #[tokio::test]
    async fn test_get_and_remove() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let conn = registry.register(tx, agent()).await;

        assert!(registry.get(conn.id()).await.is_some());
        assert!(registry.remove(conn.id()).await.is_some());
        assert!(registry.get(conn.id()).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let conn = registry.register(tx, agent()).await;

        assert!(registry.remove(conn.id()).await.is_some());
        assert!(registry.remove(conn.id()).await.is_none());
        assert!(registry.remove("never-registered").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_liveness_flags() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let conn = registry.register(tx, agent()).await;

        assert!(conn.is_alive());
        assert!(conn.mark_pending());
        assert!(!conn.is_alive());
        // Second probe without a pong reports the miss
        assert!(!conn.mark_pending());
        conn.mark_alive();
        assert!(conn.is_alive());
    }

    #[tokio::test]
    async fn test_send_reports_full_and_closed() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        let conn = registry.register(tx, agent()).await;

        assert_eq!(conn.send(ServerMessage::agent_reply("one")), Delivery::Queued);
        assert_eq!(conn.send(ServerMessage::agent_reply("two")), Delivery::Full);
        assert!(matches!(rx.recv().await, Some(Outbound::Frame(_))));

        conn.close();
        assert!(!conn.is_open());
        assert_eq!(conn.send(ServerMessage::agent_reply("three")), Delivery::Closed);
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_is_closed() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(4);
        let conn = registry.register(tx, agent()).await;
        drop(rx);
        assert!(!conn.is_open());
        assert_eq!(conn.send_ping(HeartbeatPayload::now()), Delivery::Closed);
    }

    #[tokio::test]
    async fn test_session_association_and_attempts() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let conn = registry.register(tx, agent()).await;

        assert!(conn.session_id().await.is_none());
        conn.set_session_id("s-1".to_string()).await;
        assert_eq!(conn.session_id().await.as_deref(), Some("s-1"));

        assert_eq!(conn.record_reconnect_attempt(), 1);
        assert_eq!(conn.record_reconnect_attempt(), 2);
        assert_eq!(conn.reconnect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_touch_moves_last_activity_forward() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let conn = registry.register(tx, agent()).await;
        let before = conn.last_active_at();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        conn.touch();
        assert!(conn.last_active_at() > before);
    }
}
