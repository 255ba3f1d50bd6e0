//! Heartbeat Monitor
//!
//! Every interval each connection is probed. A connection that has not
//! answered the previous probe by the next tick is terminated, so a dead
//! peer is removed one full interval after the ping it missed.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::RelayState;

use super::protocol::HeartbeatPayload;
use super::registry::Delivery;

/// Run one heartbeat pass. Returns the ids of terminated connections.
pub async fn heartbeat_tick(state: &RelayState) -> Vec<String> {
    let mut terminated = Vec::new();

    for conn in state.registry.snapshot().await {
        // Previous flag false means the last ping went unanswered
        if !conn.mark_pending() {
            warn!(conn_id = %conn.id(), "Missed heartbeat, terminating connection");
            if state.remove_connection(conn.id()).await {
                state.metrics.heartbeat_terminated();
                terminated.push(conn.id().to_string());
            }
            continue;
        }

        match conn.send_ping(HeartbeatPayload::now()) {
            Delivery::Queued => {}
            Delivery::Full => warn!(conn_id = %conn.id(), "Outbound queue full, heartbeat ping dropped"),
            Delivery::Closed => debug!(conn_id = %conn.id(), "Heartbeat ping to closed connection"),
        }
    }

    terminated
}

/// Start the monitor. The first pass runs one `interval` after start.
pub fn spawn_heartbeat(
    state: Arc<RelayState>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "Heartbeat monitor started");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Heartbeat monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let terminated = heartbeat_tick(&state).await;
                    if !terminated.is_empty() {
                        info!("Heartbeat terminated {} connections", terminated.len());
                    }
                }
            }
        }
    })
}
