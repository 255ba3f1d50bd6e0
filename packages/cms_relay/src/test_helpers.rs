//! Shared fixtures for unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Notify, mpsc};

use crate::agent::{Agent, AgentFactory, AgentState, ToolDescriptor};
use crate::config::RelayConfig;
use crate::error::AgentError;
use crate::state::RelayState;
use crate::ws::registry::{Connection, Outbound};

/// Agent with scripted replies and call counters.
///
/// Unscripted calls answer `reply to <content>`. When `hold` is set, each
/// `generate` waits for one `release` before answering.
#[derive(Default)]
pub struct MockAgent {
    replies: Mutex<VecDeque<Result<String, String>>>,
    state: Mutex<AgentState>,
    fail_set_state: std::sync::atomic::AtomicBool,
    generate_calls: AtomicUsize,
    state_reads: AtomicUsize,
    state_writes: AtomicUsize,
    hold: Option<Arc<Notify>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(gate: Arc<Notify>) -> Self {
        Self {
            hold: Some(gate),
            ..Self::default()
        }
    }

    pub fn with_state(self, state: AgentState) -> Self {
        *self.state.lock().unwrap() = state;
        self
    }

    pub fn reply(&self, text: &str) {
        self.replies.lock().unwrap().push_back(Ok(text.to_string()));
    }

    pub fn fail(&self, reason: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(reason.to_string()));
    }

    pub fn reject_state(&self) {
        self.fail_set_state.store(true, Ordering::SeqCst);
    }

    pub fn current_state(&self) -> AgentState {
        self.state.lock().unwrap().clone()
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn state_reads(&self) -> usize {
        self.state_reads.load(Ordering::SeqCst)
    }

    pub fn state_writes(&self) -> usize {
        self.state_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn generate(&self, content: &str) -> Result<String, AgentError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.hold {
            gate.notified().await;
        }
        let scripted = self.replies.lock().unwrap().pop_front();
        let reply = match scripted {
            Some(Ok(text)) => text,
            Some(Err(reason)) => return Err(AgentError::Generation(reason)),
            None => format!("reply to {}", content),
        };
        *self.state.lock().unwrap() = AgentState(serde_json::json!({ "last": content }));
        Ok(reply)
    }

    async fn state(&self) -> AgentState {
        self.state_reads.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().clone()
    }

    async fn set_state(&self, state: AgentState) -> Result<(), AgentError> {
        self.state_writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_set_state.load(Ordering::SeqCst) {
            return Err(AgentError::State("rejected".to_string()));
        }
        *self.state.lock().unwrap() = state;
        Ok(())
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        vec![ToolDescriptor {
            name: "mock_tool".to_string(),
            description: None,
        }]
    }
}

/// Factory handing every connection the same mock.
pub struct SharedAgent(pub Arc<MockAgent>);

impl AgentFactory for SharedAgent {
    fn create(&self) -> Arc<dyn Agent> {
        self.0.clone()
    }
}

pub fn test_state(config: RelayConfig, agent: Arc<MockAgent>) -> Arc<RelayState> {
    Arc::new(RelayState::new(config, Arc::new(SharedAgent(agent))))
}

/// Register a connection and return the receiving end of its outbound queue.
pub async fn connect(state: &RelayState) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(32);
    let conn = state.register_connection(tx).await;
    (conn, rx)
}

/// Drain everything queued so far.
pub fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

/// Next queued JSON frame, skipping heartbeat pings.
pub async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> crate::ws::protocol::OutboundFrame {
    loop {
        match rx.recv().await {
            Some(Outbound::Frame(frame)) => return frame,
            Some(Outbound::Ping(_)) => continue,
            None => panic!("outbound queue closed"),
        }
    }
}
