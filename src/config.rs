//! Runtime configuration and protocol constants

use std::time::Duration;

/// Interval between heartbeat probes
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive unanswered probes after which a session is removed
pub const MAX_MISSED_HEARTBEATS: u32 = 2;

/// Delay before reconnecting a lost signaling connection
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Size of one binary file chunk
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Bytes sent before waiting for a partition acknowledgement
pub const MAX_PARTITION_SIZE: usize = 1024 * 1024;

/// Cookie key carrying the peer identifier
pub const PEER_ID_COOKIE: &str = "peerid";

/// Label of the data channel opened by the caller
pub const DATA_CHANNEL_LABEL: &str = "data-channel";

/// Public STUN server used for candidate gathering
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Relay server settings
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Heartbeat probe interval
    pub heartbeat_interval: Duration,
    /// Unanswered probes before a session is dropped
    pub max_missed_heartbeats: u32,
}

impl RelayConfig {
    /// `host:port` string to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            host: "0.0.0.0".to_string(),
            port: 3000,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            max_missed_heartbeats: MAX_MISSED_HEARTBEATS,
        }
    }
}

/// Signaling client settings
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// WebSocket URL of the relay
    pub server_url: String,
    /// Delay before a reconnect attempt
    pub reconnect_delay: Duration,
    /// User-Agent presented to the relay
    pub user_agent: String,
    /// STUN/TURN URLs used by the native backend
    pub ice_servers: Vec<String>,
    /// Identity token presented on the first connection; the relay assigns one if absent
    pub identity: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_url: "ws://127.0.0.1:3000".to_string(),
            reconnect_delay: RECONNECT_DELAY,
            user_agent: default_user_agent(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            identity: None,
        }
    }
}

/// User-Agent for the native client, e.g. `peerdrop/0.1.0 (Linux)`
pub fn default_user_agent() -> String {
    let os = match std::env::consts::OS {
        "macos" => "Mac OS X",
        "windows" => "Windows",
        "android" => "Android",
        "ios" => "iOS",
        _ => "Linux",
    };
    format!("peerdrop/{} ({})", env!("CARGO_PKG_VERSION"), os)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_fits_partition() {
        assert!(CHUNK_SIZE <= MAX_PARTITION_SIZE);
        assert_eq!(MAX_PARTITION_SIZE % CHUNK_SIZE, 0);
    }

    #[test]
    fn test_bind_addr() {
        let config = RelayConfig {
            port: 8765,
            ..Default::default()
        };
        assert_eq!(config.bind_addr(), "0.0.0.0:8765");
    }
}
