// Session configuration
//
// Timeouts and limits for a debug session. Can be loaded from JSON, where
// durations are given in milliseconds and every field is optional:
//
//   { "handshake_timeout_ms": 5000, "reply_timeout_ms": 120000,
//     "max_packet_size": 10485760 }

use std::time::Duration;

use serde::Deserialize;

use crate::protocol::{JdwpError, JdwpResult, HEADER_SIZE};

/// Default budget for a single command round trip.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(120);

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum allowed JDWP packet size (10MB)
/// This prevents memory exhaustion from malicious or buggy JVMs
pub const DEFAULT_MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawSessionConfig")]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub reply_timeout: Duration,
    pub max_packet_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSessionConfig {
    handshake_timeout_ms: Option<u64>,
    reply_timeout_ms: Option<u64>,
    max_packet_size: Option<usize>,
}

impl From<RawSessionConfig> for SessionConfig {
    fn from(raw: RawSessionConfig) -> Self {
        let defaults = SessionConfig::default();
        Self {
            handshake_timeout: raw
                .handshake_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.handshake_timeout),
            reply_timeout: raw
                .reply_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reply_timeout),
            max_packet_size: raw.max_packet_size.unwrap_or(defaults.max_packet_size),
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> JdwpResult<Self> {
        let config: SessionConfig = serde_json::from_str(json)
            .map_err(|e| JdwpError::decode(format!("Invalid session config: {}", e)))?;
        if config.max_packet_size < HEADER_SIZE {
            return Err(JdwpError::decode(format!(
                "max_packet_size {} is smaller than a packet header",
                config.max_packet_size
            )));
        }
        Ok(config)
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }
}
