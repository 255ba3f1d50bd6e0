//! WebSocket Protocol Types
//!
//! Every frame is a JSON object `{type, payload, requestId?, sessionId?}`.
//! Inbound frames are validated here, at the parse boundary, into a
//! [`ClientMessage`] before anything is dispatched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::selection::DocumentReference;

/// `type` values a client may send.
pub const INBOUND_KINDS: &[&str] = &["user_message", "document_focus", "ping", "pong", "reconnect"];

/// Messages sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Chat input for the agent
    UserMessage(UserMessagePayload),
    /// The user moved to a document (or a field inside one)
    DocumentFocus(DocumentFocusPayload),
    /// Client-initiated liveness probe, answered with a pong
    Ping(HeartbeatPayload),
    /// Answer to a server ping
    Pong(HeartbeatPayload),
    /// Resume a previous session; the id travels in the envelope
    Reconnect(ReconnectPayload),
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserMessage(_) => "user_message",
            Self::DocumentFocus(_) => "document_focus",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Reconnect(_) => "reconnect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessagePayload {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFocusPayload {
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        rename = "type",
        skip_serializing_if = "Option::is_none"
    )]
    pub doc_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl HeartbeatPayload {
    pub fn now() -> Self {
        Self {
            timestamp: Some(Utc::now().timestamp_millis()),
        }
    }
}

/// Older clients put the session id in the payload instead of the envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Agent reply, or the outcome of a reconnect
    AgentMessage(AgentMessagePayload),
    /// Current document selection, optionally with session metadata
    DocumentSetUpdate(DocumentSetPayload),
    /// Progress notice ("thinking", "analyzing_document", "completed")
    ThinkingState(ThinkingPayload),
    /// Non-fatal failure report
    Error(ErrorPayload),
    /// Heartbeat probe
    Ping(HeartbeatPayload),
    /// Answer to a client ping
    Pong(HeartbeatPayload),
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentMessage(_) => "agent_message",
            Self::DocumentSetUpdate(_) => "document_set_update",
            Self::ThinkingState(_) => "thinking_state",
            Self::Error(_) => "error",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
        }
    }

    /// Plain agent reply stamped with the current time.
    pub fn agent_reply(message: impl Into<String>) -> Self {
        Self::AgentMessage(AgentMessagePayload {
            message: message.into(),
            timestamp: Some(Utc::now()),
            session_restored: None,
            new_session_id: None,
        })
    }

    pub fn thinking(action: &str, state: &str, message: impl Into<String>) -> Self {
        Self::ThinkingState(ThinkingPayload {
            action: Some(action.to_string()),
            message: Some(message.into()),
            document_id: None,
            state: Some(state.to_string()),
        })
    }

    pub fn error(message: impl Into<String>, code: &str) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
            code: Some(code.to_string()),
            reconnect: None,
            session_id: None,
            delay: None,
        })
    }

    /// Error frame answering a rejected inbound frame.
    pub fn frame_error(err: &FrameError) -> Self {
        Self::error(err.to_string(), err.code())
    }

    pub fn document_set(documents: &[DocumentReference], session: Option<SessionInfo>) -> Self {
        Self::DocumentSetUpdate(DocumentSetPayload {
            documents: documents.iter().map(DocumentSummary::from).collect(),
            session,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessagePayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_restored: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSetPayload {
    pub documents: Vec<DocumentSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

/// Wire view of a [`DocumentReference`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
    #[serde(
        default,
        rename = "type",
        skip_serializing_if = "Option::is_none"
    )]
    pub doc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl From<&DocumentReference> for DocumentSummary {
    fn from(doc: &DocumentReference) -> Self {
        Self {
            id: doc.id.clone(),
            title: doc.title.clone(),
            doc_type: doc.doc_type.clone(),
            path: doc.path.clone(),
            last_modified: Some(doc.last_modified),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub last_activity: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnected: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Set when the client should reconnect and resume its session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Backoff hint in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

/// A validated inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub message: ClientMessage,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
}

/// An inbound frame that failed validation. The request id is kept when it
/// could be read so the error reply can still be correlated.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedFrame {
    pub error: FrameError,
    pub request_id: Option<String>,
}

/// Envelope as it arrives, before the payload is checked against `type`.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default, rename = "requestId")]
    request_id: Option<String>,
    #[serde(default, rename = "sessionId")]
    session_id: Option<String>,
}

/// Parse and validate one text frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, RejectedFrame> {
    let raw: RawFrame = serde_json::from_str(text).map_err(|_| RejectedFrame {
        error: FrameError::Malformed,
        request_id: None,
    })?;

    if !INBOUND_KINDS.contains(&raw.kind.as_str()) {
        return Err(RejectedFrame {
            error: FrameError::UnsupportedType(raw.kind),
            request_id: raw.request_id,
        });
    }

    let payload = match raw.payload {
        Some(serde_json::Value::Null) | None => {
            serde_json::Value::Object(serde_json::Map::new())
        }
        Some(value) => value,
    };
    let tagged = serde_json::json!({ "type": raw.kind, "payload": payload });

    match serde_json::from_value::<ClientMessage>(tagged) {
        Ok(message) => {
            let session_id = match &message {
                ClientMessage::Reconnect(p) => raw.session_id.or_else(|| p.session_id.clone()),
                _ => raw.session_id,
            };
            Ok(InboundFrame {
                message,
                request_id: raw.request_id,
                session_id,
            })
        }
        Err(e) => Err(RejectedFrame {
            error: FrameError::InvalidPayload {
                kind: raw.kind,
                reason: e.to_string(),
            },
            request_id: raw.request_id,
        }),
    }
}

/// A server message plus its correlation id, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub message: ServerMessage,
    pub request_id: Option<String>,
}

impl OutboundFrame {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            message,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(&self.message)?;
        if let (Some(id), serde_json::Value::Object(map)) = (&self.request_id, &mut value) {
            map.insert(
                "requestId".to_string(),
                serde_json::Value::String(id.clone()),
            );
        }
        serde_json::to_string(&value)
    }
}

impl From<ServerMessage> for OutboundFrame {
    fn from(message: ServerMessage) -> Self {
        Self::new(message)
    }
}
