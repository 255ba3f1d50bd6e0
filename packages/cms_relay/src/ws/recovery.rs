//! Socket-level error recovery.
//!
//! A transport error that looks transient (reset, refused, timeout) leaves
//! the connection registered long enough to preserve its session and tell
//! the client when to come back. Anything else, or too many retries, drops it.

use std::error::Error as StdError;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::warn;

use crate::state::RelayState;

use super::protocol::{ErrorPayload, OutboundFrame, ServerMessage};
use super::registry::Connection;

const RECOVERABLE_KINDS: &[ErrorKind] = &[
    ErrorKind::ConnectionReset,
    ErrorKind::ConnectionRefused,
    ErrorKind::ConnectionAborted,
    ErrorKind::TimedOut,
    ErrorKind::BrokenPipe,
    ErrorKind::UnexpectedEof,
];

const RECOVERABLE_PATTERNS: &[&str] = &["reset", "refused", "timed out", "timeout", "broken pipe"];

/// Whether a socket error is worth asking the client to reconnect for.
pub fn is_recoverable(err: &(dyn StdError + 'static)) -> bool {
    let chain = || std::iter::successors(Some(err), |e: &&(dyn StdError + 'static)| (*e).source());

    if chain()
        .filter_map(|e| e.downcast_ref::<std::io::Error>())
        .any(|io| RECOVERABLE_KINDS.contains(&io.kind()))
    {
        return true;
    }

    chain().any(|e| {
        let message = e.to_string().to_lowercase();
        RECOVERABLE_PATTERNS.iter().any(|p| message.contains(p))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Ask the client to reconnect after `delay`
    Retry { delay: Duration },
    GiveUp,
}

/// Plan the response to the `attempt`-th recoverable error (1-based).
pub fn plan_recovery(attempt: u32, max_attempts: u32, base_delay: Duration) -> Recovery {
    if attempt == 0 || attempt > max_attempts {
        return Recovery::GiveUp;
    }
    let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
    Recovery::Retry {
        delay: base_delay.saturating_mul(factor),
    }
}

/// What the socket handler should do after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorOutcome {
    KeepOpen,
    Drop,
}

pub(crate) async fn handle_socket_error(
    state: &RelayState,
    conn: &Connection,
    err: &(dyn StdError + Send + Sync + 'static),
) -> ErrorOutcome {
    state.metrics.socket_error();

    if !is_recoverable(err) {
        warn!(conn_id = %conn.id(), "Unrecoverable socket error: {}", err);
        return ErrorOutcome::Drop;
    }

    let attempt = conn.record_reconnect_attempt();
    let ws = &state.config.websocket;
    match plan_recovery(attempt, ws.max_reconnect_attempts, ws.reconnect_base_delay) {
        Recovery::Retry { delay } => {
            let session_id = state.preserve_connection_session(conn).await;
            warn!(
                conn_id = %conn.id(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Recoverable socket error, asking client to reconnect: {}",
                err
            );
            let message = ServerMessage::Error(ErrorPayload {
                message: "Connection interrupted, please reconnect".to_string(),
                code: Some("connection_error".to_string()),
                reconnect: Some(true),
                session_id,
                delay: Some(delay.as_millis() as u64),
            });
            state.deliver(conn, OutboundFrame::new(message));
            ErrorOutcome::KeepOpen
        }
        Recovery::GiveUp => {
            warn!(
                conn_id = %conn.id(),
                attempt,
                "Reconnect attempts exhausted, dropping connection: {}",
                err
            );
            ErrorOutcome::Drop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::test_helpers::{MockAgent, connect, next_frame, test_state};
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error)]
    #[error("socket failed")]
    struct Wrapped(#[source] std::io::Error);

    #[test]
    fn test_io_kinds_are_recoverable() {
        let err = std::io::Error::from(ErrorKind::ConnectionReset);
        assert!(is_recoverable(&err));

        let nested = Wrapped(std::io::Error::from(ErrorKind::TimedOut));
        assert!(is_recoverable(&nested));
    }

    #[test]
    fn test_other_io_kinds_are_not() {
        let err = Wrapped(std::io::Error::new(ErrorKind::InvalidData, "bad utf-8"));
        assert!(!is_recoverable(&err));
    }

    #[test]
    fn test_message_patterns() {
        let err = std::io::Error::other("Connection Reset by peer");
        assert!(is_recoverable(&err));
        let err = std::io::Error::other("operation TIMED OUT");
        assert!(is_recoverable(&err));
        let err = std::io::Error::other("protocol violation");
        assert!(!is_recoverable(&err));
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let base = Duration::from_millis(1000);
        assert_eq!(
            plan_recovery(1, 3, base),
            Recovery::Retry { delay: Duration::from_millis(1000) }
        );
        assert_eq!(
            plan_recovery(2, 3, base),
            Recovery::Retry { delay: Duration::from_millis(2000) }
        );
        assert_eq!(
            plan_recovery(3, 3, base),
            Recovery::Retry { delay: Duration::from_millis(4000) }
        );
        assert_eq!(plan_recovery(4, 3, base), Recovery::GiveUp);
        assert_eq!(plan_recovery(0, 3, base), Recovery::GiveUp);
    }

    #[test]
    fn test_huge_attempt_counts_saturate() {
        let plan = plan_recovery(64, u32::MAX, Duration::from_secs(1));
        assert!(matches!(plan, Recovery::Retry { .. }));
    }

    #[tokio::test]
    async fn test_recoverable_error_preserves_and_asks_for_reconnect() {
        let state = test_state(RelayConfig::default(), Arc::new(MockAgent::new()));
        let (conn, mut rx) = connect(&state).await;
        conn.set_session_id("s-net".to_string()).await;
        let err = std::io::Error::from(ErrorKind::ConnectionReset);

        let outcome = handle_socket_error(&state, &conn, &err).await;
        assert_eq!(outcome, ErrorOutcome::KeepOpen);

        match next_frame(&mut rx).await.message {
            ServerMessage::Error(payload) => {
                assert_eq!(payload.code.as_deref(), Some("connection_error"));
                assert_eq!(payload.reconnect, Some(true));
                assert_eq!(payload.session_id.as_deref(), Some("s-net"));
                assert_eq!(payload.delay, Some(1000));
            }
            other => panic!("expected error, got {}", other.kind()),
        }
        assert!(state.sessions.restore("s-net").await.is_some());
    }

    #[tokio::test]
    async fn test_attempts_exhausted_drops() {
        let state = test_state(RelayConfig::default(), Arc::new(MockAgent::new()));
        let (conn, _rx) = connect(&state).await;
        let err = std::io::Error::from(ErrorKind::BrokenPipe);

        for _ in 0..3 {
            assert_eq!(handle_socket_error(&state, &conn, &err).await, ErrorOutcome::KeepOpen);
        }
        assert_eq!(handle_socket_error(&state, &conn, &err).await, ErrorOutcome::Drop);
        assert_eq!(state.metrics.snapshot().errors.socket, 4);
    }

    #[tokio::test]
    async fn test_unrecoverable_error_drops_immediately() {
        let state = test_state(RelayConfig::default(), Arc::new(MockAgent::new()));
        let (conn, _rx) = connect(&state).await;
        let err = std::io::Error::new(ErrorKind::InvalidData, "garbage");

        assert_eq!(handle_socket_error(&state, &conn, &err).await, ErrorOutcome::Drop);
        assert_eq!(conn.reconnect_attempts(), 0);
    }
}
