//! Gateway runtime configuration.
//!
//! Loaded once at startup by the bootstrap layer (out of scope here) and
//! handed to the reactor. All fields carry sensible defaults so a minimal
//! deployment needs no configuration at all.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level runtime configuration of the request-processing core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener address exposed by the transport layer
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Hard ceiling on total per-request processing time in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retry attempts across endpoints when an API does not set its own
    #[serde(default = "default_retry_attempts")]
    pub default_retry_attempts: u32,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8082".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    1
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_ms: default_request_timeout_ms(),
            default_retry_attempts: default_retry_attempts(),
        }
    }
}
