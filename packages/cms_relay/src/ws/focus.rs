//! Document focus handling.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::selection::FocusChange;
use crate::state::RelayState;

use super::protocol::{DocumentFocusPayload, ServerMessage, ThinkingPayload};

fn analysis_state(document_id: &str, action: &str, state: &str, message: &str) -> ServerMessage {
    ServerMessage::ThinkingState(ThinkingPayload {
        action: Some(action.to_string()),
        message: Some(message.to_string()),
        document_id: Some(document_id.to_string()),
        state: Some(state.to_string()),
    })
}

/// Record the user's new focus and tell every client about it.
///
/// Broadcasts an `analyzing` indicator, then the updated selection, then
/// schedules the matching `completed` indicator after the analysis delay.
pub(crate) async fn handle_document_focus(
    state: &Arc<RelayState>,
    payload: DocumentFocusPayload,
) -> JoinHandle<()> {
    let document_id = payload.document_id;
    info!(document = %document_id, path = payload.path.as_deref().unwrap_or("-"), "Document focus changed");

    state
        .broadcast(analysis_state(
            &document_id,
            "analyzing_document",
            "analyzing",
            "Analyzing document",
        ))
        .await;

    let documents = state
        .selection
        .focus(FocusChange {
            document_id: document_id.clone(),
            path: payload.path,
            title: payload.title,
            doc_type: payload.doc_type,
        })
        .await;
    if let Some(current) = state.selection.current_focus().await {
        debug!(
            document = %current.document_id,
            selected = documents.len(),
            capacity = state.selection.max_documents(),
            "Selection updated"
        );
    }
    state
        .broadcast(ServerMessage::document_set(&documents, None))
        .await;

    schedule_analysis_complete(Arc::clone(state), document_id)
}

fn schedule_analysis_complete(state: Arc<RelayState>, document_id: String) -> JoinHandle<()> {
    let delay = state.config.selection.analysis_delay;
    let cancel = state.shutdown_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(document = %document_id, "Shutdown before analysis completed");
            }
            _ = tokio::time::sleep(delay) => {
                state
                    .broadcast(analysis_state(
                        &document_id,
                        "completed",
                        "completed",
                        "Document analysis complete",
                    ))
                    .await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::test_helpers::{MockAgent, connect, next_frame, test_state};
    use std::time::Duration;

    fn focus_payload(id: &str) -> DocumentFocusPayload {
        DocumentFocusPayload {
            document_id: id.to_string(),
            path: Some(format!("/content/{}", id)),
            title: Some("Home".to_string()),
            doc_type: Some("page".to_string()),
        }
    }

    fn thinking_state(msg: &ServerMessage) -> ThinkingPayload {
        match msg {
            ServerMessage::ThinkingState(p) => p.clone(),
            other => panic!("expected thinking_state, got {}", other.kind()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_broadcasts_in_order() {
        let state = test_state(RelayConfig::default(), Arc::new(MockAgent::new()));
        let (_a, mut rx_a) = connect(&state).await;
        let (_b, mut rx_b) = connect(&state).await;

        let pending = handle_document_focus(&state, focus_payload("doc-1")).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let analyzing = thinking_state(&next_frame(rx).await.message);
            assert_eq!(analyzing.action.as_deref(), Some("analyzing_document"));
            assert_eq!(analyzing.state.as_deref(), Some("analyzing"));
            assert_eq!(analyzing.document_id.as_deref(), Some("doc-1"));

            match next_frame(rx).await.message {
                ServerMessage::DocumentSetUpdate(update) => {
                    assert_eq!(update.documents.len(), 1);
                    assert_eq!(update.documents[0].id, "doc-1");
                    assert_eq!(update.documents[0].title, "Home");
                    assert!(update.session.is_none());
                }
                other => panic!("expected document_set_update, got {}", other.kind()),
            }
        }

        tokio::time::sleep(Duration::from_millis(1600)).await;
        pending.await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let completed = thinking_state(&next_frame(rx).await.message);
            assert_eq!(completed.action.as_deref(), Some("completed"));
            assert_eq!(completed.state.as_deref(), Some("completed"));
            assert_eq!(completed.document_id.as_deref(), Some("doc-1"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_not_sent_before_delay() {
        let state = test_state(RelayConfig::default(), Arc::new(MockAgent::new()));
        let (_a, mut rx) = connect(&state).await;

        let _pending = handle_document_focus(&state, focus_payload("doc-2")).await;
        next_frame(&mut rx).await;
        next_frame(&mut rx).await;

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_completion() {
        let state = test_state(RelayConfig::default(), Arc::new(MockAgent::new()));
        let (_a, mut rx) = connect(&state).await;

        let pending = handle_document_focus(&state, focus_payload("doc-3")).await;
        next_frame(&mut rx).await;
        next_frame(&mut rx).await;

        state.shutdown_token().cancel();
        pending.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refocus_moves_document_to_front() {
        let state = test_state(RelayConfig::default(), Arc::new(MockAgent::new()));
        handle_document_focus(&state, focus_payload("a")).await;
        handle_document_focus(&state, focus_payload("b")).await;
        handle_document_focus(&state, focus_payload("a")).await;

        let ids: Vec<_> = state
            .selection
            .documents()
            .await
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
