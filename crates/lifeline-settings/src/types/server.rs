//! Server, delivery, engine and logging settings.
//!
//! Grouped here because they are all small and runtime-oriented.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// WebSocket server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Ping interval for connected clients.
    pub heartbeat_interval_ms: u64,
    /// Clients silent for longer than this are dropped.
    pub client_timeout_ms: u64,
    /// Outbound frame buffer per connection.
    pub client_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            heartbeat_interval_ms: 30_000,
            client_timeout_ms: 90_000,
            client_buffer: 256,
        }
    }
}

/// Fanout delivery policy for every subscriber.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    /// Pending envelopes per subscriber before it is dropped.
    pub queue_size: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            queue_size: 1024,
            max_retries: 3,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Messages included in snapshots and crisis alerts.
    pub recent_messages: usize,
    /// Command backlog per conversation actor.
    pub mailbox_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            recent_messages: 10,
            mailbox_size: 256,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter (`RUST_LOG` takes precedence).
    pub level: String,
    /// Per-module overrides, e.g. `{"lifeline_detect": "debug"}`.
    pub module_levels: HashMap<String, String>,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            module_levels: HashMap::new(),
            json: true,
        }
    }
}
