//! WebSocket Handler
//!
//! One task per socket: a writer draining the connection's outbound queue
//! and a reader feeding the dispatcher. Whichever side ends first ends the
//! connection, and cleanup always goes through [`RelayState::remove_connection`].

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::FrameError;
use crate::state::RelayState;

use super::dispatch::{ConnectionContext, dispatch};
use super::exchange::spawn_exchange_worker;
use super::protocol::{OutboundFrame, ServerMessage};
use super::recovery::{ErrorOutcome, handle_socket_error};
use super::registry::Outbound;

/// Serve one upgraded WebSocket until either side closes it.
pub async fn handle_relay_ws(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Outbound>(state.config.websocket.send_channel_capacity);
    let conn = state.register_connection(tx).await;
    let connection_id = conn.id().to_string();

    let (exchange_tx, _worker) = spawn_exchange_worker(state.clone(), conn.clone());
    let ctx = ConnectionContext {
        conn: conn.clone(),
        state: state.clone(),
        exchange_tx,
    };

    // Task to send messages to WebSocket
    let sender_cancel = conn.cancel_token();
    let sender_task = async move {
        loop {
            let item = tokio::select! {
                _ = sender_cancel.cancelled() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let frame = match item {
                Outbound::Frame(frame) => frame,
                Outbound::Ping(payload) => {
                    let stamp = payload.timestamp.unwrap_or_default().to_be_bytes();
                    if ws_sender.send(Message::Ping(stamp.to_vec().into())).await.is_err() {
                        break;
                    }
                    OutboundFrame::new(ServerMessage::Ping(payload))
                }
            };

            let json = match frame.to_json() {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    // Task to handle incoming messages
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => dispatch(&ctx, text.as_str()).await,
                Ok(Message::Binary(_)) => {
                    ctx.state.metrics.frame_rejected();
                    ctx.state
                        .deliver(&ctx.conn, ServerMessage::frame_error(&FrameError::Malformed));
                }
                Ok(Message::Pong(_)) => {
                    ctx.conn.touch();
                    ctx.conn.mark_alive();
                }
                Ok(Message::Ping(_)) => ctx.conn.touch(),
                Ok(Message::Close(_)) => {
                    debug!("Client closed connection");
                    break;
                }
                Err(e) => {
                    if handle_socket_error(&ctx.state, &ctx.conn, &e).await == ErrorOutcome::Drop {
                        break;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!("Sender task ended"),
        _ = input_task => debug!("Input task ended"),
    }

    // The worker stops on its own once the dropped reader's sender is gone
    state.remove_connection(&connection_id).await;

    let active = state.registry.len().await;
    info!(conn_id = %connection_id, active, "WebSocket connection closed");
}
