//! Configuration structures.
//!
//! Configuration is loaded from a JSON file; every section and field falls
//! back to its default when omitted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::Result;

/// Global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Broker server configuration.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Bus client configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Object-proxy service configuration.
    #[serde(default)]
    pub dconnect: DConnectConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Broker server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// TCP bind address.
    pub listen_addr: String,

    /// Maximum concurrent client connections.
    pub max_connections: usize,

    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Slow consumers that cannot accept a frame within this window are dropped.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:47110".to_string(),
            max_connections: 1000,
            max_frame_bytes: 16 * 1024 * 1024,
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Bus client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Deadline for HELLO / AddTarget / DelTarget / Forward round trips.
    #[serde(with = "humantime_serde")]
    pub control_timeout: Duration,

    /// Largest payload accepted for a single envelope.
    pub max_message_bytes: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            control_timeout: Duration::from_secs(10),
            max_message_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Object-proxy service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DConnectConfig {
    /// Deadline for every synchronous SETUP / INVOKE.
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Largest incoming request or reply accepted.
    pub max_message_bytes: usize,

    /// Largest array capacity accepted from a peer.
    pub max_array_elements: u32,

    /// How long a "client is down" record is kept.
    #[serde(with = "humantime_serde")]
    pub client_down_retention: Duration,

    /// Maximum number of "client is down" records.
    pub client_down_capacity: usize,

    /// Worker pool executing inbound requests.
    pub workers: WorkerPoolConfig,
}

impl Default for DConnectConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(300),
            max_message_bytes: 16 * 1024 * 1024,
            max_array_elements: 1 << 20,
            client_down_retention: Duration::from_secs(15 * 60),
            client_down_capacity: 10_000,
            workers: WorkerPoolConfig::default(),
        }
    }
}

/// Elastic worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Workers kept alive even when idle.
    pub min_workers: usize,

    /// Hard cap on worker threads.
    pub max_workers: usize,

    /// Idle workers above `min_workers` exit after this long.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Upper bound on how long a submitter waits for a busy pool to catch
    /// up before it spawns another worker.
    #[serde(with = "humantime_serde")]
    pub backlog_grace: Duration,

    /// How long shutdown waits for workers to exit.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 1024,
            idle_timeout: Duration::from_secs(10),
            backlog_grace: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
