//! Client configuration
//!
//! Settings are read from a TOML file and may be overridden from the command line.
//! Durations are given in milliseconds.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mesh::RECONNECT_TIMEOUT;
use crate::network::{MeshError, PING_INTERVAL, PONG_TIMEOUT};
use crate::protocol::PeerId;

/// Default relay endpoint
const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080";

/// Default public STUN server
const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// One ICE server entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerConfig {
    /// Server URLs; a missing `stun:`/`turn:` scheme is added
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Servers with a username are TURN relays
    pub fn is_turn(&self) -> bool {
        self.username.is_some() || self.urls.iter().any(|u| u.starts_with("turn"))
    }

    /// URLs with their scheme
    pub fn normalized_urls(&self) -> Vec<String> {
        self.urls
            .iter()
            .map(|url| {
                if url.starts_with("stun:")
                    || url.starts_with("stuns:")
                    || url.starts_with("turn:")
                    || url.starts_with("turns:")
                {
                    url.clone()
                } else if self.username.is_some() {
                    format!("turn:{}", url)
                } else {
                    format!("stun:{}", url)
                }
            })
            .collect()
    }
}

/// Mesh client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    /// Relay endpoint, `ws://` or `wss://`
    pub server_url: String,

    /// Local user id as known to the relay
    pub user_id: PeerId,

    /// Credential sent in the authentication message
    pub credential: String,

    /// Interval between two PING probes
    pub ping_interval_ms: u64,

    /// Silence after which the relay connection is considered dead
    pub pong_timeout_ms: u64,

    /// Grace period before a failed peer connection is recreated
    pub reconnect_timeout_ms: u64,

    /// How often to look for a selected candidate pair after connecting
    pub stats_retries: u32,

    pub stats_retry_delay_ms: u64,

    /// Also send peer diagnostics to the relay as PEER_LOG
    pub forward_peer_logs: bool,

    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            user_id: PeerId(0),
            credential: String::new(),
            ping_interval_ms: PING_INTERVAL.as_millis() as u64,
            pong_timeout_ms: PONG_TIMEOUT.as_millis() as u64,
            reconnect_timeout_ms: RECONNECT_TIMEOUT.as_millis() as u64,
            stats_retries: 3,
            stats_retry_delay_ms: 1000,
            forward_peer_logs: false,
            ice_servers: vec![IceServerConfig::stun(DEFAULT_STUN_SERVER)],
        }
    }
}

impl MeshConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            MeshError::InvalidConfig(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, MeshError> {
        let config: MeshConfig = toml::from_str(content)
            .map_err(|e| MeshError::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, MeshError> {
        toml::to_string_pretty(self)
            .map_err(|e| MeshError::InvalidConfig(format!("Failed to serialize config: {}", e)))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn stats_retry_delay(&self) -> Duration {
        Duration::from_millis(self.stats_retry_delay_ms)
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<(), MeshError> {
        if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            return Err(MeshError::InvalidConfig(format!(
                "Invalid relay URL: {}. Must start with ws:// or wss://",
                self.server_url
            )));
        }

        for (name, value) in [
            ("ping_interval_ms", self.ping_interval_ms),
            ("pong_timeout_ms", self.pong_timeout_ms),
            ("reconnect_timeout_ms", self.reconnect_timeout_ms),
            ("stats_retry_delay_ms", self.stats_retry_delay_ms),
        ] {
            if value == 0 {
                return Err(MeshError::InvalidConfig(format!("{} must be positive", name)));
            }
        }

        if self.pong_timeout_ms <= self.ping_interval_ms {
            return Err(MeshError::InvalidConfig(format!(
                "pong_timeout_ms ({}) must be larger than ping_interval_ms ({})",
                self.pong_timeout_ms, self.ping_interval_ms
            )));
        }

        for server in &self.ice_servers {
            if server.urls.is_empty() || server.urls.iter().any(|u| u.is_empty()) {
                return Err(MeshError::InvalidConfig(
                    "ICE server URL cannot be empty".to_string(),
                ));
            }
            if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
                return Err(MeshError::InvalidConfig(format!(
                    "TURN server {:?} requires username and credential",
                    server.urls
                )));
            }
        }

        Ok(())
    }
}
