//! Agent exchanges and session reconnection.
//!
//! Work that waits on the agent runs on a per-connection worker so the
//! socket reader never blocks. The worker handles one exchange at a time,
//! which keeps one connection's agent calls in arrival order.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::AgentState;
use crate::state::RelayState;

use super::protocol::{AgentMessagePayload, OutboundFrame, ServerMessage};
use super::registry::Connection;

/// Exchanges queued per connection before new ones are refused.
pub(crate) const MAX_PENDING_EXCHANGES: usize = 16;

/// Work queued for a connection's exchange worker.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Exchange {
    UserMessage {
        content: String,
        request_id: Option<String>,
    },
    Reconnect {
        session_id: Option<String>,
        request_id: Option<String>,
    },
}

/// Start the worker for `conn`. It stops once every sender is dropped.
pub(crate) fn spawn_exchange_worker(
    state: Arc<RelayState>,
    conn: Arc<Connection>,
) -> (mpsc::Sender<Exchange>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Exchange>(MAX_PENDING_EXCHANGES);
    let handle = tokio::spawn(async move {
        while let Some(exchange) = rx.recv().await {
            if !conn.is_open() {
                debug!(conn_id = %conn.id(), "Connection closed, dropping queued exchange");
                continue;
            }
            match exchange {
                Exchange::UserMessage {
                    content,
                    request_id,
                } => handle_user_message(&state, &conn, &content, request_id).await,
                Exchange::Reconnect {
                    session_id,
                    request_id,
                } => handle_reconnect(&state, &conn, session_id, request_id).await,
            }
        }
        debug!(conn_id = %conn.id(), "Exchange worker stopped");
    });
    (tx, handle)
}

/// Run one user message through the agent.
///
/// The thinking indicator goes out before the agent is called. Agent state
/// is preserved both before and after the call, so a disconnect mid-call
/// still leaves the latest snapshot in the session store. The first message
/// on a connection also mints its session and announces it after the reply.
pub(crate) async fn handle_user_message(
    state: &RelayState,
    conn: &Connection,
    content: &str,
    request_id: Option<String>,
) {
    state.deliver(
        conn,
        OutboundFrame::new(ServerMessage::thinking(
            "thinking",
            "thinking",
            "Processing your message",
        ))
        .with_request_id(request_id.clone()),
    );

    let (session_id, created) = state.ensure_session(conn).await;
    let agent = conn.agent();
    state
        .sessions
        .preserve(&session_id, agent.state().await, conn.id())
        .await;

    match agent.generate(content).await {
        Ok(reply) => {
            state
                .sessions
                .preserve(&session_id, agent.state().await, conn.id())
                .await;
            state.deliver(
                conn,
                OutboundFrame::new(ServerMessage::agent_reply(reply)).with_request_id(request_id),
            );
        }
        Err(e) => {
            state.metrics.agent_error();
            error!(
                conn_id = %conn.id(),
                session = %session_id,
                request_id = request_id.as_deref().unwrap_or("-"),
                "Agent failed to process message: {:#}",
                e
            );
            state.deliver(
                conn,
                OutboundFrame::new(ServerMessage::error("Failed to process message", "agent_error"))
                    .with_request_id(request_id),
            );
        }
    }

    // Tell the client which session to reconnect with
    if created {
        let documents = state.selection.documents().await;
        let session = state.session_info(&session_id, None).await;
        state.deliver(conn, ServerMessage::document_set(&documents, Some(session)));
    }
}

/// Rebind `conn` to a preserved session, or start a fresh one.
///
/// Either way the client gets an `agent_message` saying which happened,
/// followed by the current document selection with the session attached.
pub(crate) async fn handle_reconnect(
    state: &RelayState,
    conn: &Connection,
    session_id: Option<String>,
    request_id: Option<String>,
) {
    // Keep whatever the connection was doing before it switches sessions
    if let Some(previous) = state.preserve_connection_session(conn).await {
        debug!(conn_id = %conn.id(), session = %previous, "Preserved session before reconnect");
    }

    // Past the expiry window counts as not found, swept or not
    let stored = match &session_id {
        Some(id) => state.sessions.restore_live(id).await,
        None => None,
    };

    if let Some(session) = stored {
        match conn.agent().set_state(session.agent_state.clone()).await {
            Ok(()) => {
                conn.set_session_id(session.id.clone()).await;
                state
                    .sessions
                    .preserve(&session.id, session.agent_state, conn.id())
                    .await;
                state.metrics.session_restored();
                info!(
                    conn_id = %conn.id(),
                    session = %session.id,
                    previous_client = %session.last_client_id,
                    "Session restored"
                );
                send_reconnect_outcome(state, conn, &session.id, true, request_id).await;
                return;
            }
            Err(e) => {
                warn!(
                    conn_id = %conn.id(),
                    session = %session.id,
                    "Stored agent state rejected, starting a new session: {}",
                    e
                );
            }
        }
    }

    state.metrics.session_not_found();
    let new_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.agent().set_state(AgentState::empty()).await {
        warn!(conn_id = %conn.id(), "Failed to reset agent state: {}", e);
    }
    conn.set_session_id(new_id.clone()).await;
    state
        .sessions
        .preserve(&new_id, AgentState::empty(), conn.id())
        .await;
    state.metrics.session_created();
    info!(
        conn_id = %conn.id(),
        requested = session_id.as_deref().unwrap_or("-"),
        session = %new_id,
        "Previous session not found, new session created"
    );
    send_reconnect_outcome(state, conn, &new_id, false, request_id).await;
}

async fn send_reconnect_outcome(
    state: &RelayState,
    conn: &Connection,
    session_id: &str,
    restored: bool,
    request_id: Option<String>,
) {
    let message = if restored {
        "Session restored"
    } else {
        "Previous session not found, new session created"
    };
    let reply = ServerMessage::AgentMessage(AgentMessagePayload {
        message: message.to_string(),
        timestamp: Some(Utc::now()),
        session_restored: Some(restored),
        new_session_id: (!restored).then(|| session_id.to_string()),
    });
    state.deliver(conn, OutboundFrame::new(reply).with_request_id(request_id));

    let documents = state.selection.documents().await;
    let session = state.session_info(session_id, Some(restored)).await;
    state.deliver(conn, ServerMessage::document_set(&documents, Some(session)));
}
