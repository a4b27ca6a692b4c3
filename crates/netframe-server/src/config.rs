//! Server-wide configuration (§6.3).
//!
//! One struct per concern (listener/admission, buffer pool, dispatcher
//! middleware defaults, id generation), assembled into a single
//! [`ServerConfig`] the binary builds from CLI args.

use std::time::Duration;

use netframe_core::{PoolConfig, UniqueIdConfig};
use netframe_proto::CompressionAlgo;

/// Listener- and limiter-facing settings.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP port to bind.
    pub port: u16,
    /// Maximum concurrent connections across all peers.
    pub max_connections: u32,
    /// Initial receive buffer size requested per connection.
    pub recv_buffer_size: usize,
    /// Maximum concurrent connections from a single IP.
    pub max_per_ip_connections: u32,
    /// Idle timeout before a session is considered dead.
    pub session_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 4433,
            max_connections: 10_000,
            recv_buffer_size: 4096,
            max_per_ip_connections: 64,
            session_timeout: netframe_core::session::DEFAULT_SESSION_TIMEOUT,
        }
    }
}

/// Dispatcher-facing settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Default compression algorithm applied by the codec.
    pub compression_algo: CompressionAlgo,
    /// Minimum payload length before compression is attempted.
    pub compression_threshold: usize,
    /// Default per-handler timeout when a descriptor doesn't override it.
    pub default_timeout: Duration,
    /// Worker pool size for handler invocation.
    pub worker_count: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            compression_algo: CompressionAlgo::Lz4,
            compression_threshold: 256,
            default_timeout: Duration::from_secs(5),
            worker_count: 8,
        }
    }
}

/// Every configuration group the server needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listener and admission-control settings.
    pub network: NetworkConfig,
    /// Byte buffer pool sizing.
    pub pool: PoolConfig,
    /// Dispatcher middleware defaults.
    pub dispatcher: DispatcherConfig,
    /// Snowflake id generator settings.
    pub unique_id: UniqueIdConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            pool: PoolConfig::default(),
            dispatcher: DispatcherConfig::default(),
            unique_id: UniqueIdConfig { id_type: 0, machine_id: 0, epoch_ms: 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_network_config_matches_spec_defaults() {
        let cfg = NetworkConfig::default();
        assert_eq!(cfg.port, 4433);
        assert!(cfg.max_per_ip_connections <= cfg.max_connections);
    }

    #[test]
    fn default_unique_id_config_validates() {
        let cfg = ServerConfig::default();
        assert!(cfg.unique_id.validate(1_700_000_000_000).is_ok());
    }
}
