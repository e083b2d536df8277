//! Configuration surface. No environment variables, no CLI, no files —
//! plain structs the embedding application constructs.

use std::time::Duration;

/// Server-side configuration: the pre-shared secret used as the HMAC key
/// for challenge signing (it has no bearer-token semantics despite
/// sometimes being called an "API key") plus the compression threshold
/// applied before a session's shared key exists.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub pre_shared_secret: String,
    /// Uncompressed-size threshold in bytes; `None`/negative disables
    /// compression.
    pub compression_threshold: Option<i64>,
}

impl ServerConfig {
    pub fn new(pre_shared_secret: impl Into<String>) -> Self {
        ServerConfig { pre_shared_secret: pre_shared_secret.into(), compression_threshold: Some(512) }
    }
}

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub pre_shared_secret: String,
    pub auto_reconnect: bool,
    /// `-1` means unlimited.
    pub max_reconnect_attempts: i64,
    pub reconnect_delay: Duration,
    pub enable_ping: bool,
    pub ping_interval: Duration,
    pub connection_timeout: Duration,
    pub compression_threshold: Option<i64>,
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
    pub client_identifier: Option<String>,
    pub identification_metadata: Option<String>,
}

impl ClientConfig {
    pub fn new(pre_shared_secret: impl Into<String>) -> Self {
        ClientConfig {
            pre_shared_secret: pre_shared_secret.into(),
            auto_reconnect: false,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(3),
            enable_ping: true,
            ping_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            compression_threshold: Some(512),
            protocol_version: "1".to_string(),
            client_name: "cipherlink".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            client_identifier: None,
            identification_metadata: None,
        }
    }
}
