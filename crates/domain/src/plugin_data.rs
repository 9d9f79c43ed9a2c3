//! Queued plugin output: monitor telemetry and action responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One monitor tick's output, queued per `(plugin_id, artifact_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEntry {
    pub plugin_id: String,
    pub artifact_id: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_ms: u64,
}

/// Outcome of one triggered action, identified by its `trigger_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResponse {
    pub trigger_id: String,
    pub plugin_id: String,
    pub action_id: String,
    pub status: ActionStatus,
    pub return_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_ts: DateTime<Utc>,
    pub execution_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Failure,
}

impl ActionResponse {
    /// Synthetic failure emitted when a trigger names an artifact that is
    /// not deployed.
    pub fn not_deployed(trigger_id: &str, plugin_id: &str, action_id: &str) -> Self {
        Self {
            trigger_id: trigger_id.to_owned(),
            plugin_id: plugin_id.to_owned(),
            action_id: action_id.to_owned(),
            status: ActionStatus::Failure,
            return_code: -1,
            output: None,
            error: Some("Action not deployed".into()),
            executed_ts: Utc::now(),
            execution_ms: 0,
        }
    }
}
