//! Deployed script artifacts (monitors and actions).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A controller-supplied script deployed on this endpoint.
///
/// `source` is the decoded text; `checksum` is the SHA-256 of that text and
/// must hold at deploy time. Monitors carry an `interval_ms`; actions do
/// not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptArtifact {
    pub plugin_id: String,
    pub artifact_id: String,
    pub source: String,
    pub platforms: Vec<String>,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    pub deployed_ts: DateTime<Utc>,
}

impl ScriptArtifact {
    /// Registry key: artifacts are identified by `(plugin_id, artifact_id)`.
    pub fn key(&self) -> (String, String) {
        (self.plugin_id.clone(), self.artifact_id.clone())
    }
}
