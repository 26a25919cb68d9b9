use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and retry knobs for the messaging core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatConfig {
    /// How often active clients are expected to call `heartbeat`.
    pub heartbeat_interval_ms: u64,
    /// No heartbeat for this long marks a session offline.
    pub heartbeat_timeout_ms: u64,
    /// Hidden pages stay online this long before going offline.
    pub visibility_grace_ms: u64,
    /// Offline sessions older than this are dropped from presence records.
    pub session_retention_ms: u64,
    /// Compare-and-set attempts before a write gives up.
    pub max_cas_retries: u32,
    pub resubscribe_backoff_base_ms: u64,
    pub resubscribe_backoff_max_ms: u64,
    /// Period of the background maintenance tick.
    pub maintenance_interval_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            visibility_grace_ms: 15_000,
            session_retention_ms: 24 * 60 * 60 * 1000,
            max_cas_retries: 16,
            resubscribe_backoff_base_ms: 500,
            resubscribe_backoff_max_ms: 30_000,
            maintenance_interval_ms: 1_000,
        }
    }
}

impl ChatConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }
}
