//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client (initiator) configuration
    pub client: Option<ClientConfig>,
    /// Server (responder) configuration
    pub server: Option<ServerConfig>,
    /// Tunnel engine configuration, shared by both sides
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Client-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local SOCKS5 listen address
    pub socks_listen: String,
    /// Carrier endpoint to dial
    pub carrier_addr: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socks_listen: "127.0.0.1:9015".to_string(),
            carrier_addr: "127.0.0.1:10443".to_string(),
        }
    }
}

/// Server-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Carrier listen address
    pub carrier_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            carrier_listen: "0.0.0.0:10443".to_string(),
        }
    }
}

/// Tunnel engine configuration
///
/// Messages whose routing head addresses a peer other than
/// `peer_name_self` are dropped on receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Name this peer answers to in routing heads
    pub peer_name_self: String,
    /// Name of the remote peer, written into outgoing heads
    pub peer_name_other: String,
    /// Capacity of the shared outgoing bundle channel
    pub push_chan_size: usize,
    /// Capacity of each tunnel's inbound payload channel
    pub pull_chan_size: usize,
    /// Out-of-order packets buffered per tunnel before dropping
    pub reorder_capacity: usize,
    /// Seconds without traffic before a tunnel is closed
    pub tunnel_idle_timeout_secs: u64,
    /// Seconds the initiator waits for a ConnectAck
    pub connect_timeout_secs: u64,
    /// Milliseconds a partially filled carrier message may wait before flush
    pub gather_max_delay_ms: u64,
    /// Initial reconnect backoff in seconds, doubled per failure
    pub reconnect_backoff_secs: u64,
    /// Reconnect backoff cap in seconds
    pub reconnect_backoff_max_secs: u64,
    /// Tunnel id counter wraps at this value
    pub max_tunnel_id: u64,
    /// Dump gather batching statistics on transport close
    pub gather_stats: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            peer_name_self: "client".to_string(),
            peer_name_other: "server".to_string(),
            push_chan_size: 512,
            pull_chan_size: 512,
            reorder_capacity: 128,
            tunnel_idle_timeout_secs: 600,
            connect_timeout_secs: 30,
            gather_max_delay_ms: 50,
            reconnect_backoff_secs: 10,
            reconnect_backoff_max_secs: 300,
            max_tunnel_id: 1_000_000,
            gather_stats: false,
        }
    }
}

impl TunnelConfig {
    /// Swap the peer names, turning a client-side config into the matching
    /// server-side one.
    pub fn flipped(mut self) -> Self {
        std::mem::swap(&mut self.peer_name_self, &mut self.peer_name_other);
        self
    }

    /// Idle timeout as a [`Duration`]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_idle_timeout_secs)
    }

    /// Connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Gather flush delay as a [`Duration`]
    pub fn gather_max_delay(&self) -> Duration {
        Duration::from_millis(self.gather_max_delay_ms)
    }

    /// Initial reconnect backoff as a [`Duration`]
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    /// Reconnect backoff cap as a [`Duration`]
    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_max_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TunnelConfig::default();
        assert_eq!(config.push_chan_size, 512);
        assert_eq!(config.pull_chan_size, 512);
        assert_eq!(config.reorder_capacity, 128);
        assert_eq!(config.idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.gather_max_delay(), Duration::from_millis(50));
        assert_eq!(config.max_tunnel_id, 1_000_000);
    }

    #[test]
    fn test_flipped() {
        let config = TunnelConfig::default().flipped();
        assert_eq!(config.peer_name_self, "server");
        assert_eq!(config.peer_name_other, "client");
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [tunnel]
            peer_name_self = "alice"
            gather_max_delay_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.tunnel.peer_name_self, "alice");
        assert_eq!(config.tunnel.gather_max_delay_ms, 100);
        assert_eq!(config.tunnel.push_chan_size, 512);
    }
}
