//! Message Router
//!
//! Parses each inbound text frame and routes it by type. Nothing that
//! happens here closes the connection: bad frames get an `error` reply and
//! the socket stays open.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::FrameError;
use crate::state::RelayState;

use super::exchange::Exchange;
use super::focus::handle_document_focus;
use super::protocol::{ClientMessage, HeartbeatPayload, OutboundFrame, ServerMessage, parse_frame};
use super::registry::Connection;

/// Per-connection context shared between the socket handler and the dispatcher.
pub(crate) struct ConnectionContext {
    pub conn: Arc<Connection>,
    pub state: Arc<RelayState>,
    pub exchange_tx: mpsc::Sender<Exchange>,
}

impl ConnectionContext {
    fn reply(&self, message: ServerMessage, request_id: Option<String>) {
        self.state
            .deliver(&self.conn, OutboundFrame::new(message).with_request_id(request_id));
    }

    fn queue(&self, exchange: Exchange, request_id: Option<String>) {
        match self.exchange_tx.try_send(exchange) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = %self.conn.id(), "Too many pending messages, refusing");
                self.reply(
                    ServerMessage::error("Too many pending messages, try again shortly", "busy"),
                    request_id,
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn_id = %self.conn.id(), "Exchange worker gone, dropping message");
            }
        }
    }
}

/// Handle one raw text frame from the client.
pub(crate) async fn dispatch(ctx: &ConnectionContext, text: &str) {
    ctx.conn.touch();
    ctx.state.metrics.frame_received();

    let frame = match parse_frame(text) {
        Ok(frame) => frame,
        Err(rejected) => {
            reject(ctx, &rejected.error, rejected.request_id);
            return;
        }
    };

    debug!(conn_id = %ctx.conn.id(), kind = frame.message.kind(), "Inbound frame");
    let request_id = frame.request_id;

    match frame.message {
        ClientMessage::Pong(_) => ctx.conn.mark_alive(),
        ClientMessage::Ping(payload) => {
            ctx.conn.mark_alive();
            let pong = HeartbeatPayload {
                timestamp: payload.timestamp.or(HeartbeatPayload::now().timestamp),
            };
            ctx.reply(ServerMessage::Pong(pong), request_id);
        }
        ClientMessage::DocumentFocus(payload) => {
            if payload.document_id.trim().is_empty() {
                let err = FrameError::InvalidPayload {
                    kind: "document_focus".to_string(),
                    reason: "documentId must not be empty".to_string(),
                };
                reject(ctx, &err, request_id);
                return;
            }
            handle_document_focus(&ctx.state, payload).await;
        }
        ClientMessage::UserMessage(payload) => {
            if payload.content.trim().is_empty() {
                ctx.reply(
                    ServerMessage::error("Message content must not be empty", "empty_message"),
                    request_id,
                );
                return;
            }
            ctx.queue(
                Exchange::UserMessage {
                    content: payload.content,
                    request_id: request_id.clone(),
                },
                request_id,
            );
        }
        ClientMessage::Reconnect(_) => {
            // parse_frame already folded the payload's sessionId into the envelope
            ctx.queue(
                Exchange::Reconnect {
                    session_id: frame.session_id,
                    request_id: request_id.clone(),
                },
                request_id,
            );
        }
    }
}

fn reject(ctx: &ConnectionContext, err: &FrameError, request_id: Option<String>) {
    warn!(conn_id = %ctx.conn.id(), code = err.code(), "Rejected inbound frame: {}", err);
    ctx.state.metrics.frame_rejected();
    ctx.reply(ServerMessage::frame_error(err), request_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::test_helpers::{MockAgent, connect, next_frame, test_state};
    use crate::ws::exchange::MAX_PENDING_EXCHANGES;
    use crate::ws::protocol::ErrorPayload;
    use crate::ws::registry::Outbound;

    async fn context() -> (ConnectionContext, mpsc::Receiver<Outbound>, mpsc::Receiver<Exchange>) {
        let state = test_state(RelayConfig::default(), Arc::new(MockAgent::new()));
        let (conn, rx) = connect(&state).await;
        let (exchange_tx, exchange_rx) = mpsc::channel(MAX_PENDING_EXCHANGES);
        (
            ConnectionContext {
                conn,
                state,
                exchange_tx,
            },
            rx,
            exchange_rx,
        )
    }

    fn error_code(frame: &OutboundFrame) -> Option<&str> {
        match &frame.message {
            ServerMessage::Error(ErrorPayload { code, .. }) => code.as_deref(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_and_connection_stays() {
        let (ctx, mut rx, _ex) = context().await;

        dispatch(&ctx, "{not json").await;

        let reply = next_frame(&mut rx).await;
        assert_eq!(error_code(&reply), Some("invalid_message"));
        assert!(ctx.conn.is_open());
        assert_eq!(ctx.state.registry.len().await, 1);
        assert_eq!(ctx.state.metrics.snapshot().frames.rejected, 1);
    }

    #[tokio::test]
    async fn test_unknown_type_echoes_request_id() {
        let (ctx, mut rx, _ex) = context().await;

        dispatch(&ctx, r#"{"type":"teleport","payload":{},"requestId":"r9"}"#).await;

        let reply = next_frame(&mut rx).await;
        assert_eq!(error_code(&reply), Some("unsupported_type"));
        assert_eq!(reply.request_id.as_deref(), Some("r9"));
    }

    #[tokio::test]
    async fn test_pong_marks_alive() {
        let (ctx, _rx, _ex) = context().await;
        ctx.conn.mark_pending();
        assert!(!ctx.conn.is_alive());

        dispatch(&ctx, r#"{"type":"pong","payload":{"timestamp":1}}"#).await;
        assert!(ctx.conn.is_alive());
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (ctx, mut rx, _ex) = context().await;

        dispatch(&ctx, r#"{"type":"ping","payload":{"timestamp":42}}"#).await;

        let reply = next_frame(&mut rx).await;
        assert_eq!(
            reply.message,
            ServerMessage::Pong(HeartbeatPayload { timestamp: Some(42) })
        );
    }

    #[tokio::test]
    async fn test_empty_user_message_rejected() {
        let (ctx, mut rx, mut ex) = context().await;

        dispatch(&ctx, r#"{"type":"user_message","payload":{"content":"   "}}"#).await;

        assert_eq!(error_code(&next_frame(&mut rx).await), Some("empty_message"));
        assert!(ex.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_user_message_queued_for_worker() {
        let (ctx, _rx, mut ex) = context().await;

        dispatch(
            &ctx,
            r#"{"type":"user_message","payload":{"content":"hi"},"requestId":"r1"}"#,
        )
        .await;

        assert_eq!(
            ex.try_recv().unwrap(),
            Exchange::UserMessage {
                content: "hi".to_string(),
                request_id: Some("r1".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_reconnect_queued_with_envelope_session() {
        let (ctx, _rx, mut ex) = context().await;

        dispatch(
            &ctx,
            r#"{"type":"reconnect","payload":{},"sessionId":"s-1"}"#,
        )
        .await;

        assert_eq!(
            ex.try_recv().unwrap(),
            Exchange::Reconnect {
                session_id: Some("s-1".to_string()),
                request_id: None,
            }
        );
    }

    #[tokio::test]
    async fn test_full_worker_queue_replies_busy() {
        let (ctx, mut rx, _ex) = context().await;
        let frame = r#"{"type":"user_message","payload":{"content":"hi"}}"#;
        for _ in 0..MAX_PENDING_EXCHANGES {
            dispatch(&ctx, frame).await;
        }
        assert!(rx.try_recv().is_err());

        dispatch(&ctx, frame).await;
        assert_eq!(error_code(&next_frame(&mut rx).await), Some("busy"));
    }

    #[tokio::test]
    async fn test_blank_document_id_rejected() {
        let (ctx, mut rx, _ex) = context().await;

        dispatch(&ctx, r#"{"type":"document_focus","payload":{"documentId":""}}"#).await;

        assert_eq!(error_code(&next_frame(&mut rx).await), Some("invalid_payload"));
        assert!(ctx.state.selection.documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_touches_connection() {
        let (ctx, _rx, _ex) = context().await;
        let before = ctx.conn.last_active_at();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        dispatch(&ctx, r#"{"type":"pong","payload":{}}"#).await;
        assert!(ctx.conn.last_active_at() > before);
    }
}
