//! Typed configuration for one server process
//!
//! Each component reads its own section. Defaults are chosen so that a
//! process can be started with nothing but its `ServerInfo`.

use shared::ServerInfo;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum concurrent connections a frontend accepts
    pub max_connections: usize,
    /// Reason sent to a client when it is kicked without an explicit one
    pub kick_reason: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            kick_reason: "kicked".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendSessionConfig {
    /// Snapshots kept for `cached` lookups before the oldest is evicted
    pub cache_capacity: usize,
}

impl Default for BackendSessionConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    /// Destroy a channel as soon as its last member leaves
    pub destroy_when_empty: bool,
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// How long a remote call may take before it counts as unreachable
    pub timeout_ms: u64,
    /// Remote methods this process refuses to serve, e.g. `session.kickByUid`
    pub blocked_methods: Vec<String>,
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            blocked_methods: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server: ServerInfo,
    pub session: SessionConfig,
    pub backend_session: BackendSessionConfig,
    pub channel: ChannelConfig,
    pub rpc: RpcConfig,
}

impl ServerConfig {
    pub fn new(server: ServerInfo) -> Self {
        Self {
            server,
            session: SessionConfig::default(),
            backend_session: BackendSessionConfig::default(),
            channel: ChannelConfig::default(),
            rpc: RpcConfig::default(),
        }
    }
}
