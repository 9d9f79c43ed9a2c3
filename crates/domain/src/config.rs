//! The agent configuration document.
//!
//! A single JSON document persisted as `config.json` under the platform
//! config root. Every field has a serde default so partially-written or
//! older documents still load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionStatus, OfflineModeSettings};
use crate::policy::Policy;

/// Lower bound on the enforcement tick. Attempts to configure a smaller
/// interval are rejected.
pub const MIN_CHECK_INTERVAL_MS: u64 = 5_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Document
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Opaque identity assigned by the controller on first contact.
    /// Once set it never changes.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Stable hash of host characteristics; derived once and cached.
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub controller_host: Option<String>,
    #[serde(default = "d_controller_port")]
    pub controller_port: u16,
    /// The discovery key: the TXT `uuid` the controller advertises.
    #[serde(default)]
    pub controller_identifier: Option<String>,
    /// PEM-encoded RSA public key pinned at pairing time. Immutable after
    /// provisioning; replacing it requires a controlled re-pair.
    #[serde(default)]
    pub pinned_public_key: Option<String>,
    /// Bearer token for controller requests.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "d_check_interval")]
    pub check_interval_ms: u64,
    #[serde(default = "d_log_level")]
    pub log_level: String,
    #[serde(default = "d_true")]
    pub enable_discovery: bool,
    #[serde(default = "d_true")]
    pub auto_update: bool,
    /// Port for the loopback status server consumed by the helper.
    #[serde(default = "d_status_port")]
    pub status_port: u16,
    /// Cached policy set, replaced on every successful sync.
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub last_sync_ts: Option<DateTime<Utc>>,
    /// Last persisted connection snapshot. Advisory only: on restart the
    /// state is re-derived from `is_configured()` and the first sync.
    #[serde(default)]
    pub connection_state: ConnectionStatus,
    #[serde(default)]
    pub offline_mode_settings: OfflineModeSettings,
    /// Config document schema version.
    #[serde(default = "d_version")]
    pub version: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: None,
            machine_id: None,
            controller_host: None,
            controller_port: d_controller_port(),
            controller_identifier: None,
            pinned_public_key: None,
            auth_token: None,
            check_interval_ms: d_check_interval(),
            log_level: d_log_level(),
            enable_discovery: true,
            auto_update: true,
            status_port: d_status_port(),
            policies: Vec::new(),
            last_sync_ts: None,
            connection_state: ConnectionStatus::default(),
            offline_mode_settings: OfflineModeSettings::default(),
            version: d_version(),
        }
    }
}

impl AgentConfig {
    /// The agent can talk to a controller once it knows who to look for
    /// and whose signature to trust.
    pub fn is_configured(&self) -> bool {
        self.controller_identifier
            .as_deref()
            .is_some_and(|s| !s.is_empty())
            && self
                .pinned_public_key
                .as_deref()
                .is_some_and(|s| !s.is_empty())
    }

    /// Validate a proposed check interval.
    pub fn validate_check_interval(ms: u64) -> crate::Result<u64> {
        if ms < MIN_CHECK_INTERVAL_MS {
            return Err(crate::Error::Config(format!(
                "check_interval_ms {ms} below minimum {MIN_CHECK_INTERVAL_MS}"
            )));
        }
        Ok(ms)
    }
}

fn d_controller_port() -> u16 {
    9144
}
fn d_check_interval() -> u64 {
    30_000
}
fn d_log_level() -> String {
    "info".into()
}
fn d_true() -> bool {
    true
}
fn d_status_port() -> u16 {
    8443
}
fn d_version() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_loads_with_defaults() {
        let cfg: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.check_interval_ms, 30_000);
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.enable_discovery);
        assert!(cfg.auto_update);
        assert_eq!(cfg.status_port, 8443);
        assert!(!cfg.is_configured());
    }

    #[test]
    fn default_matches_empty_document() {
        let parsed: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(
            serde_json::to_value(AgentConfig::default()).unwrap(),
            serde_json::to_value(parsed).unwrap()
        );
    }

    #[test]
    fn configured_requires_identifier_and_key() {
        let mut cfg = AgentConfig::default();
        cfg.controller_identifier = Some("id-A".into());
        assert!(!cfg.is_configured());
        cfg.pinned_public_key = Some("-----BEGIN PUBLIC KEY-----".into());
        assert!(cfg.is_configured());
        cfg.controller_identifier = Some(String::new());
        assert!(!cfg.is_configured());
    }

    #[test]
    fn check_interval_boundary() {
        assert!(AgentConfig::validate_check_interval(4_999).is_err());
        assert_eq!(AgentConfig::validate_check_interval(5_000).unwrap(), 5_000);
    }

    #[test]
    fn save_load_is_identity_on_shape() {
        let mut cfg = AgentConfig::default();
        cfg.agent_id = Some("a1".into());
        cfg.auth_token = Some("t1".into());
        cfg.policies.push(crate::policy::Policy {
            id: "p1".into(),
            process_name: "steam".into(),
            allowed: false,
            schedule: None,
            quotas: None,
            created_ts: None,
            updated_ts: None,
        });
        let json = serde_json::to_string_pretty(&cfg).unwrap();
        let back: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(serde_json::to_value(&cfg).unwrap(), serde_json::to_value(&back).unwrap());
    }
}
