use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::RelayError;

// =============================================================================
// File config (figment-deserialized from defaults / cms-relay.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   cms-relay.toml:  [websocket]
//                    heartbeat_interval_secs = 10
//
//   env var:         RELAY_WEBSOCKET__HEARTBEAT_INTERVAL_SECS=10
//
//   (double underscore = nesting, single underscore stays within field names)

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "cms-relay.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub websocket: WebSocketFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub selection: SelectionFileConfig,
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How many successive ports to try when the configured one is taken.
    #[serde(default)]
    pub port_fallback_attempts: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            port_fallback_attempts: 0,
        }
    }
}

/// Connection liveness and recovery (lives under `[websocket]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebSocketFileConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_send_channel_capacity")]
    pub send_channel_capacity: usize,
}

impl Default for WebSocketFileConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            send_channel_capacity: default_send_channel_capacity(),
        }
    }
}

/// Session retention (lives under `[session]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_session_expiry_secs")]
    pub expiry_secs: u64,
    /// 0 means "same as the expiry window".
    #[serde(default)]
    pub sweep_interval_secs: u64,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_session_expiry_secs(),
            sweep_interval_secs: 0,
        }
    }
}

/// Document selection tracking (lives under `[selection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectionFileConfig {
    #[serde(default = "default_max_documents")]
    pub max_documents: usize,
    #[serde(default = "default_analysis_delay_ms")]
    pub analysis_delay_ms: u64,
}

impl Default for SelectionFileConfig {
    fn default() -> Self {
        Self {
            max_documents: default_max_documents(),
            analysis_delay_ms: default_analysis_delay_ms(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8765
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_max_reconnect_attempts() -> u32 {
    3
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_send_channel_capacity() -> usize {
    100
}
fn default_session_expiry_secs() -> u64 {
    3600
}
fn default_max_documents() -> usize {
    10
}
fn default_analysis_delay_ms() -> u64 {
    1500
}

/// Build a figment that layers: defaults → config file → RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_SERVER__PORT=9000`  →  `server.port = 9000`
///   `RELAY_SESSION__EXPIRY_SECS=600`  →  `session.expiry_secs = 600`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("RELAY_").split("__"))
}

/// Extract the layered config into a [`FileConfig`].
pub fn read_config(config_path: &Path) -> Result<FileConfig, RelayError> {
    Ok(load_config(config_path).extract()?)
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the relay)
// =============================================================================

/// Runtime configuration for one relay instance.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub websocket: WebSocketConfig,
    pub session: SessionConfig,
    pub selection: SelectionConfig,
}

#[derive(Clone, Debug)]
pub struct WebSocketConfig {
    /// Ping cadence; an unanswered ping is fatal at the next tick
    pub heartbeat_interval: Duration,
    /// Recoverable socket errors tolerated before the connection is dropped
    pub max_reconnect_attempts: u32,
    /// First backoff hint sent to the client; doubles per attempt
    pub reconnect_base_delay: Duration,
    /// Outbound queue depth per connection
    pub send_channel_capacity: usize,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Inactivity window after which a session is swept
    pub expiry: Duration,
    pub sweep_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct SelectionConfig {
    pub max_documents: usize,
    /// Delay before the "completed" analysis notice is broadcast
    pub analysis_delay: Duration,
}

impl RelayConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        let expiry = Duration::from_secs(fc.session.expiry_secs);
        Self {
            websocket: WebSocketConfig {
                heartbeat_interval: Duration::from_secs(fc.websocket.heartbeat_interval_secs.max(1)),
                max_reconnect_attempts: fc.websocket.max_reconnect_attempts,
                reconnect_base_delay: Duration::from_millis(fc.websocket.reconnect_base_delay_ms),
                send_channel_capacity: fc.websocket.send_channel_capacity.max(1),
            },
            session: SessionConfig {
                expiry,
                sweep_interval: if fc.session.sweep_interval_secs == 0 {
                    expiry.max(Duration::from_secs(1))
                } else {
                    Duration::from_secs(fc.session.sweep_interval_secs)
                },
            },
            selection: SelectionConfig {
                max_documents: fc.selection.max_documents.max(1),
                analysis_delay: Duration::from_millis(fc.selection.analysis_delay_ms),
            },
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

impl ServerFileConfig {
    /// Candidate listen addresses: the configured port, then the fallbacks.
    pub fn candidate_addrs(&self) -> Result<Vec<SocketAddr>, std::net::AddrParseError> {
        let ip: std::net::IpAddr = self.host.parse()?;
        Ok((0..=self.port_fallback_attempts)
            .filter_map(|offset| self.port.checked_add(offset))
            .map(|port| SocketAddr::new(ip, port))
            .collect())
    }
}
