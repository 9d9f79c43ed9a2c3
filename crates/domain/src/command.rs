//! Controller commands pulled by the agent, and their results.

use serde::{Deserialize, Serialize};

use crate::policy::Policy;

/// A command pulled from the controller. The `id` deduplicates retries;
/// the payload is the internally-tagged [`CommandKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(flatten)]
    pub kind: CommandKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CommandKind {
    #[serde(rename = "POLICY_UPDATE")]
    PolicyUpdate { policies: Vec<Policy> },

    #[serde(rename = "DEPLOY_MONITOR")]
    DeployMonitor {
        plugin_id: String,
        monitor_id: String,
        /// Base64-encoded script text.
        source: String,
        platforms: Vec<String>,
        /// SHA-256 hex digest of the decoded text.
        checksum: String,
        interval_ms: u64,
    },

    #[serde(rename = "DEPLOY_ACTION")]
    DeployAction {
        plugin_id: String,
        action_id: String,
        source: String,
        platforms: Vec<String>,
        checksum: String,
    },

    #[serde(rename = "TRIGGER_ACTION")]
    TriggerAction {
        trigger_id: String,
        plugin_id: String,
        action_id: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },

    #[serde(rename = "REMOVE_MONITOR")]
    RemoveMonitor {
        plugin_id: String,
        monitor_id: String,
    },

    #[serde(rename = "REMOVE_ACTION")]
    RemoveAction { plugin_id: String, action_id: String },

    /// Only whitelisted fields are applied; the rest of the object is
    /// ignored by the processor.
    #[serde(rename = "UPDATE_CONFIG")]
    UpdateConfig {
        #[serde(default)]
        config: serde_json::Value,
    },

    #[serde(rename = "UPDATE_AVAILABLE")]
    UpdateAvailable {
        version: String,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        auto_apply: Option<bool>,
    },

    /// Forward-compatibility: unrecognized types are acknowledged as
    /// unhandled rather than failing the batch.
    #[serde(other)]
    Unknown,
}

/// Outcome of one dispatched command, returned to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok(command_id: &str, result: serde_json::Value) -> Self {
        Self {
            command_id: command_id.to_owned(),
            success: true,
            skipped: false,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(command_id: &str, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.to_owned(),
            success: false,
            skipped: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Duplicate delivery inside the idempotency window.
    pub fn skipped(command_id: &str) -> Self {
        Self {
            command_id: command_id.to_owned(),
            success: true,
            skipped: true,
            result: None,
            error: None,
        }
    }
}
