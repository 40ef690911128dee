//! Session configuration.
//!
//! Every field has a default, so hosts can deserialize a partial JSON
//! object (camelCase keys) and rely on the defaults for the rest.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one collaboration session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CollabConfig {
    /// `host[:port]` of the sync endpoint
    pub host: String,
    /// Use `wss://` instead of `ws://`
    pub secure: bool,
    /// Base reconnect delay; attempt `n` waits `base * min(n, 5)`
    pub reconnect_base_interval_ms: u64,
    /// Consecutive failed attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Quiet period coalescing bursts of local `sync()` calls
    pub debounce_window_ms: u64,
    /// How often silent peers are pruned and presence is re-requested
    pub awareness_refresh_interval_ms: u64,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            host: "localhost:8080".to_string(),
            secure: false,
            reconnect_base_interval_ms: 3000,
            max_reconnect_attempts: 10,
            debounce_window_ms: 100,
            awareness_refresh_interval_ms: 15_000,
        }
    }
}

impl CollabConfig {
    /// Config pointing at `host` with every other field defaulted.
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn reconnect_base_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_interval_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn awareness_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.awareness_refresh_interval_ms)
    }
}
