//! CMS relay
//!
//! WebSocket relay between a CMS chat UI and an LLM agent. Each browser
//! connection gets its own agent; conversations survive reconnects through
//! the session store, and document focus changes are shared with every
//! connected client.
//!
//! | Module      | Role                                              |
//! |-------------|---------------------------------------------------|
//! | `ws`        | registry, heartbeat, router, reconnect, handler   |
//! | `session`   | reconnect-survivable agent state with expiry      |
//! | `selection` | user focus and the bounded document selection     |
//! | `agent`     | collaborator contract and the echo agent          |
//! | `server`    | axum router, bind with port fallback, shutdown    |

pub mod agent;
pub mod config;
pub mod error;
pub mod metrics;
pub mod selection;
pub mod server;
pub mod session;
pub mod state;
pub mod ws;

#[cfg(test)]
mod test_helpers;

pub use agent::{Agent, AgentFactory, AgentState, EchoAgent, ToolDescriptor};
pub use config::{FileConfig, RelayConfig};
pub use error::{AgentError, FrameError, RelayError};
pub use server::{RelayServer, bind, bind_first};
pub use state::RelayState;
