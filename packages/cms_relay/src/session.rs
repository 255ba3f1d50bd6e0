//! Session Store
//!
//! Keeps agent state for a session id independently of any connection so a
//! client can reconnect and pick up where it left off. Entries expire after a
//! window of inactivity measured from `last_active_at`.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::AgentState;
use crate::metrics::ServerMetrics;

/// Preserved conversation state for one session id.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub agent_state: AgentState,
    /// Connection that most recently owned this session (diagnostic only)
    pub last_client_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    expiry: chrono::Duration,
    metrics: Arc<ServerMetrics>,
}

impl SessionStore {
    pub fn new(expiry: Duration, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            expiry: chrono::Duration::from_std(expiry).unwrap_or(chrono::Duration::MAX),
            metrics,
        }
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(session.last_active_at) > self.expiry
    }

    /// Store a snapshot for `session_id`, replacing whatever was there.
    ///
    /// The first `created_at` survives overwrites; everything else is
    /// last-writer-wins. Expired sessions are swept afterwards.
    pub async fn preserve(&self, session_id: &str, agent_state: AgentState, client_id: &str) {
        self.preserve_at(session_id, agent_state, client_id, Utc::now())
            .await;
    }

    pub(crate) async fn preserve_at(
        &self,
        session_id: &str,
        agent_state: AgentState,
        client_id: &str,
        now: DateTime<Utc>,
    ) {
        {
            let mut sessions = self.sessions.write().await;
            let created_at = sessions
                .get(session_id)
                .map(|s| s.created_at)
                .unwrap_or(now);
            sessions.insert(
                session_id.to_string(),
                Session {
                    id: session_id.to_string(),
                    agent_state,
                    last_client_id: client_id.to_string(),
                    created_at,
                    last_active_at: now,
                },
            );
        }
        debug!(session = %session_id, conn_id = %client_id, "Session preserved");
        self.sweep_expired_at(now).await;
    }

    /// Copy out the session, if it is still held.
    pub async fn restore(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Like [`restore`](Self::restore), but an entry past the expiry window
    /// counts as gone even if no sweep has removed it yet.
    pub async fn restore_live(&self, session_id: &str) -> Option<Session> {
        self.restore_live_at(session_id, Utc::now()).await
    }

    pub(crate) async fn restore_live_at(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .filter(|s| !self.is_expired(s, now))
            .cloned()
    }

    /// Drop every session idle for longer than the expiry window.
    /// Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    pub(crate) async fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|_, s| !self.is_expired(s, now));
            before - sessions.len()
        };
        if removed > 0 {
            self.metrics.sessions_swept(removed);
            debug!("Swept {} expired sessions", removed);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        info!(
            interval_secs = interval.as_secs(),
            "Session sweeper started"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Session sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = store.sweep_expired().await;
                        if removed > 0 {
                            let remaining = store.len().await;
                            info!(remaining, "Session sweep removed {} entries", removed);
                        }
                    }
                }
            }
        })
    }
}
