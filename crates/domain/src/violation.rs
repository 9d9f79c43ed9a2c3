//! Policy-violation records reported to the controller on enforcement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emitted when a disallowed process was found running and terminated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub policy_id: String,
    pub process_name: String,
    pub process_info: serde_json::Value,
    pub action: String,
    pub ts: DateTime<Utc>,
}

impl Violation {
    pub fn terminated(
        policy_id: &str,
        process_name: &str,
        process_info: serde_json::Value,
    ) -> Self {
        Self {
            policy_id: policy_id.to_owned(),
            process_name: process_name.to_owned(),
            process_info,
            action: "terminated".into(),
            ts: Utc::now(),
        }
    }
}
