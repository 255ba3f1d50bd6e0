//! Relay WebSocket layer
//!
//! One WebSocket per CMS client that:
//! - Answers chat messages through the connection's own agent
//! - Shares document focus changes with every connected client
//! - Survives reconnects by rebinding to a preserved session

mod dispatch;
mod exchange;
mod focus;
mod handler;
pub mod heartbeat;
pub mod protocol;
pub mod recovery;
pub mod registry;

pub use handler::handle_relay_ws;
pub use heartbeat::{heartbeat_tick, spawn_heartbeat};
pub use protocol::{ClientMessage, OutboundFrame, ServerMessage, parse_frame};
pub use registry::{Connection, ConnectionRegistry, Delivery, Outbound};
