//! Relay metrics for observability
//!
//! Plain atomic counters; a snapshot is logged on shutdown.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently registered connections
    pub active_connections: AtomicU64,
    /// Total connections since start
    pub total_connections: AtomicU64,
    /// Connections terminated for missing a heartbeat
    pub heartbeat_terminations: AtomicU64,

    // Frame metrics
    /// Frames received from clients
    pub frames_received: AtomicU64,
    /// Frames queued to clients
    pub frames_sent: AtomicU64,
    /// Frames dropped because a client's queue was full
    pub frames_dropped: AtomicU64,
    /// Inbound frames answered with an error frame
    pub frames_rejected: AtomicU64,

    // Session metrics
    pub sessions_created: AtomicU64,
    pub sessions_restored: AtomicU64,
    pub sessions_not_found: AtomicU64,
    pub sessions_expired: AtomicU64,

    // Error metrics
    /// Agent calls that failed
    pub agent_errors: AtomicU64,
    /// Transport-level errors seen on sockets
    pub socket_errors: AtomicU64,

    /// Start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn heartbeat_terminated(&self) {
        self.heartbeat_terminations.fetch_add(1, Ordering::Relaxed);
    }

    // Frame tracking
    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    // Session tracking
    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_restored(&self) {
        self.sessions_restored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_not_found(&self) {
        self.sessions_not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_swept(&self, count: usize) {
        self.sessions_expired
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    // Error tracking
    pub fn agent_error(&self) {
        self.agent_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn socket_error(&self) {
        self.socket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                heartbeat_terminations: self.heartbeat_terminations.load(Ordering::Relaxed),
            },
            frames: FrameMetrics {
                received: self.frames_received.load(Ordering::Relaxed),
                sent: self.frames_sent.load(Ordering::Relaxed),
                dropped: self.frames_dropped.load(Ordering::Relaxed),
                rejected: self.frames_rejected.load(Ordering::Relaxed),
            },
            sessions: SessionMetrics {
                created: self.sessions_created.load(Ordering::Relaxed),
                restored: self.sessions_restored.load(Ordering::Relaxed),
                not_found: self.sessions_not_found.load(Ordering::Relaxed),
                expired: self.sessions_expired.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                agent: self.agent_errors.load(Ordering::Relaxed),
                socket: self.socket_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub frames: FrameMetrics,
    pub sessions: SessionMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub heartbeat_terminations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub created: u64,
    pub restored: u64,
    pub not_found: u64,
    pub expired: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub agent: u64,
    pub socket: u64,
}
