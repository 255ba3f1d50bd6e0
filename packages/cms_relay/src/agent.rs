//! Agent collaborator contract.
//!
//! The relay never looks inside the agent: it hands over user text, gets text
//! back, and copies an opaque state snapshot in and out so conversations can
//! survive a reconnect. Each connection gets its own agent from an
//! [`AgentFactory`], which keeps conversation state scoped per session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::AgentError;

/// Opaque snapshot of an agent's conversation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentState(pub serde_json::Value);

impl AgentState {
    /// Snapshot stored for a session that has no history yet.
    pub fn empty() -> Self {
        Self(serde_json::Value::Object(serde_json::Map::new()))
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            serde_json::Value::Null => true,
            serde_json::Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::empty()
    }
}

/// A tool the agent can invoke on the content-management side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// Produce a reply for one user message.
    async fn generate(&self, content: &str) -> Result<String, AgentError>;

    /// Copy out the current conversation state.
    async fn state(&self) -> AgentState;

    /// Replace the conversation state wholesale.
    async fn set_state(&self, state: AgentState) -> Result<(), AgentError>;

    fn tools(&self) -> Vec<ToolDescriptor>;
}

/// Creates one agent per connection.
pub trait AgentFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Agent>;
}

impl<F> AgentFactory for F
where
    F: Fn() -> Arc<dyn Agent> + Send + Sync,
{
    fn create(&self) -> Arc<dyn Agent> {
        self()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct HistoryEntry {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct EchoHistory {
    #[serde(default)]
    messages: Vec<HistoryEntry>,
}

/// Loopback agent used when no real agent is wired in.
///
/// Echoes every message back and records the exchange in its state, which is
/// enough to exercise session preservation end to end.
#[derive(Debug, Default)]
pub struct EchoAgent {
    history: Mutex<EchoHistory>,
}

impl EchoAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> Arc<dyn AgentFactory> {
        Arc::new(|| Arc::new(EchoAgent::new()) as Arc<dyn Agent>)
    }
}

#[async_trait]
impl Agent for EchoAgent {
    async fn generate(&self, content: &str) -> Result<String, AgentError> {
        let reply = format!("You said: {}", content);
        let mut history = self.history.lock().await;
        history.messages.push(HistoryEntry {
            role: "user".to_string(),
            content: content.to_string(),
        });
        history.messages.push(HistoryEntry {
            role: "assistant".to_string(),
            content: reply.clone(),
        });
        Ok(reply)
    }

    async fn state(&self) -> AgentState {
        let history = self.history.lock().await;
        match serde_json::to_value(&*history) {
            Ok(value) => AgentState(value),
            Err(_) => AgentState::empty(),
        }
    }

    async fn set_state(&self, state: AgentState) -> Result<(), AgentError> {
        let restored = if state.is_empty() {
            EchoHistory::default()
        } else {
            serde_json::from_value::<EchoHistory>(state.0)
                .map_err(|e| AgentError::State(e.to_string()))?
        };
        *self.history.lock().await = restored;
        Ok(())
    }

    fn tools(&self) -> Vec<ToolDescriptor> {
        Vec::new()
    }
}
