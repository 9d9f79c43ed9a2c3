//! Durable queue of action responses.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use pw_domain::plugin_data::ActionResponse;
use pw_domain::Result;

/// Action responses awaiting upload, persisted to
/// `action-responses/pending.json`. Ordered; acked by `trigger_id`.
pub struct ResponseQueue {
    path: PathBuf,
    responses: RwLock<Vec<ActionResponse>>,
    max_entries: Option<usize>,
}

impl ResponseQueue {
    /// Load or create the queue at `<state_dir>/action-responses/pending.json`.
    pub fn open(state_dir: &Path, max_entries: Option<usize>) -> Result<Self> {
        let path = state_dir.join("action-responses").join("pending.json");
        let responses: Vec<ActionResponse> = crate::fsio::load_json_or_default(&path, Vec::new());
        tracing::info!(
            pending = responses.len(),
            path = %path.display(),
            "action-response queue loaded"
        );
        Ok(Self {
            path,
            responses: RwLock::new(responses),
            max_entries,
        })
    }

    /// Append one response, persisting before returning.
    pub fn append(&self, response: ActionResponse) -> Result<()> {
        let mut responses = self.responses.write();
        responses.push(response);
        if let Some(cap) = self.max_entries {
            if responses.len() > cap {
                let excess = responses.len() - cap;
                responses.drain(..excess);
                tracing::warn!(dropped = excess, cap, "response queue over soft cap, pruned oldest");
            }
        }
        crate::fsio::atomic_write_json(&self.path, &*responses)
    }

    /// Snapshot of everything pending, in append order.
    pub fn pending(&self) -> Vec<ActionResponse> {
        self.responses.read().clone()
    }

    /// Remove the responses with the acked trigger ids; unknown ids are
    /// ignored (re-ack is a no-op).
    pub fn ack(&self, trigger_ids: &[String]) -> Result<usize> {
        let ids: HashSet<&str> = trigger_ids.iter().map(String::as_str).collect();
        let mut responses = self.responses.write();
        let before = responses.len();
        responses.retain(|r| !ids.contains(r.trigger_id.as_str()));
        let removed = before - responses.len();
        if removed > 0 {
            crate::fsio::atomic_write_json(&self.path, &*responses)?;
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.responses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pw_domain::plugin_data::ActionStatus;

    fn response(trigger: &str) -> ActionResponse {
        ActionResponse {
            trigger_id: trigger.into(),
            plugin_id: "pl".into(),
            action_id: "a".into(),
            status: ActionStatus::Success,
            return_code: 0,
            output: None,
            error: None,
            executed_ts: Utc::now(),
            execution_ms: 5,
        }
    }

    #[test]
    fn append_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let q = ResponseQueue::open(tmp.path(), None).unwrap();
        q.append(response("t1")).unwrap();
        q.append(response("t2")).unwrap();

        let q2 = ResponseQueue::open(tmp.path(), None).unwrap();
        assert_eq!(q2.len(), 2);
        assert_eq!(q2.pending()[0].trigger_id, "t1");
    }

    #[test]
    fn ack_by_trigger_id() {
        let tmp = tempfile::tempdir().unwrap();
        let q = ResponseQueue::open(tmp.path(), None).unwrap();
        q.append(response("t1")).unwrap();
        q.append(response("t2")).unwrap();

        assert_eq!(q.ack(&["t1".into()]).unwrap(), 1);
        assert_eq!(q.pending()[0].trigger_id, "t2");
        // Re-ack: no-op.
        assert_eq!(q.ack(&["t1".into()]).unwrap(), 0);
    }
}
