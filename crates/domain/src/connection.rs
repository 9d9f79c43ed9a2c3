//! Connection-state model shared between the sync loop and its observers.
//!
//! The state machine logic itself lives in the agent crate; these are the
//! persisted shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connectivity classification of the controller link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Missing identifier or pinned key; the loop idles.
    #[default]
    Unconfigured,
    /// Configured but not yet (re)established.
    Connecting,
    Online,
    /// Repeated failures; retries slow down.
    Degraded,
    /// Persistent failures; retries slow down further.
    Offline,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unconfigured => "UNCONFIGURED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Online => "ONLINE",
            ConnectionState::Degraded => "DEGRADED",
            ConnectionState::Offline => "OFFLINE",
        }
    }
}

/// Thresholds and retry cadence for the connection state machine.
///
/// The controller may override these via `offline_mode_settings` on sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfflineModeSettings {
    /// Consecutive failures before ONLINE degrades.
    #[serde(default = "d_degraded_threshold")]
    pub degraded_threshold: u32,
    /// Consecutive failures before DEGRADED goes OFFLINE.
    #[serde(default = "d_offline_threshold")]
    pub offline_threshold: u32,
    /// After this many days offline the agent flags the condition in its
    /// status output (policies keep enforcing from cache).
    #[serde(default = "d_max_offline_days")]
    pub max_offline_days: u32,
    #[serde(default = "d_retry_connecting")]
    pub retry_connecting_secs: u64,
    #[serde(default = "d_retry_degraded")]
    pub retry_degraded_secs: u64,
    #[serde(default = "d_retry_offline")]
    pub retry_offline_secs: u64,
}

impl Default for OfflineModeSettings {
    fn default() -> Self {
        Self {
            degraded_threshold: d_degraded_threshold(),
            offline_threshold: d_offline_threshold(),
            max_offline_days: d_max_offline_days(),
            retry_connecting_secs: d_retry_connecting(),
            retry_degraded_secs: d_retry_degraded(),
            retry_offline_secs: d_retry_offline(),
        }
    }
}

/// Snapshot of the connection state machine, persisted across restarts and
/// exposed to the status server.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConnectionStatus {
    pub current: ConnectionState,
    #[serde(default)]
    pub last_success_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_attempt_ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub offline_since_ts: Option<DateTime<Utc>>,
}

fn d_degraded_threshold() -> u32 {
    3
}
fn d_offline_threshold() -> u32 {
    15
}
fn d_max_offline_days() -> u32 {
    7
}
fn d_retry_connecting() -> u64 {
    30
}
fn d_retry_degraded() -> u64 {
    120
}
fn d_retry_offline() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_match_contract() {
        let s = OfflineModeSettings::default();
        assert_eq!(s.degraded_threshold, 3);
        assert_eq!(s.offline_threshold, 15);
        assert_eq!(s.max_offline_days, 7);
        assert_eq!(s.retry_connecting_secs, 30);
        assert_eq!(s.retry_degraded_secs, 120);
        assert_eq!(s.retry_offline_secs, 600);
    }

    #[test]
    fn state_serializes_screaming() {
        let json = serde_json::to_string(&ConnectionState::Degraded).unwrap();
        assert_eq!(json, "\"DEGRADED\"");
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let s: OfflineModeSettings =
            serde_json::from_str(r#"{"offline_threshold": 20}"#).unwrap();
        assert_eq!(s.offline_threshold, 20);
        assert_eq!(s.degraded_threshold, 3);
    }
}
