use std::net::SocketAddr;

/// Errors surfaced to whoever embeds the relay.
///
/// Per-frame failures never show up here; they are answered on the
/// connection that caused them (see [`FrameError`]).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("port already in use: {addr}")]
    PortInUse { addr: SocketAddr },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] figment::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Classify a listener bind failure.
    pub fn from_bind(addr: SocketAddr, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::AddrInUse {
            Self::PortInUse { addr }
        } else {
            Self::Bind { addr, source: err }
        }
    }

    pub fn is_port_in_use(&self) -> bool {
        matches!(self, Self::PortInUse { .. })
    }
}

/// Why an inbound frame could not be dispatched. Always non-fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid message")]
    Malformed,

    #[error("unsupported message type: {0}")]
    UnsupportedType(String),

    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

impl FrameError {
    /// Wire code carried in the `error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed => "invalid_message",
            Self::UnsupportedType(_) => "unsupported_type",
            Self::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

/// Failures reported by an agent collaborator.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("agent state rejected: {0}")]
    State(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
