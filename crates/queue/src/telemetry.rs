//! Durable queue of monitor telemetry.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use pw_domain::plugin_data::TelemetryEntry;
use pw_domain::Result;

use crate::fsio;

/// Monitor output awaiting upload, persisted to `data-queue/pending.json`.
///
/// Entries are ordered within each `(plugin_id, artifact_id)` key; `ack`
/// removes whole keys (the upload ships every pending entry for a key).
pub struct TelemetryQueue {
    path: PathBuf,
    entries: RwLock<Vec<TelemetryEntry>>,
    /// Optional soft cap; oldest entries are pruned past it.
    max_entries: Option<usize>,
}

impl TelemetryQueue {
    /// Load or create the queue at `<state_dir>/data-queue/pending.json`.
    pub fn open(state_dir: &Path, max_entries: Option<usize>) -> Result<Self> {
        let path = state_dir.join("data-queue").join("pending.json");
        let entries: Vec<TelemetryEntry> = fsio::load_json_or_default(&path, Vec::new());
        tracing::info!(
            pending = entries.len(),
            path = %path.display(),
            "telemetry queue loaded"
        );
        Ok(Self {
            path,
            entries: RwLock::new(entries),
            max_entries,
        })
    }

    /// Append one entry, persisting before returning.
    pub fn append(&self, entry: TelemetryEntry) -> Result<()> {
        let mut entries = self.entries.write();
        entries.push(entry);
        if let Some(cap) = self.max_entries {
            if entries.len() > cap {
                let excess = entries.len() - cap;
                entries.drain(..excess);
                tracing::warn!(dropped = excess, cap, "telemetry queue over soft cap, pruned oldest");
            }
        }
        fsio::atomic_write_json(&self.path, &*entries)
    }

    /// Snapshot of everything pending, in append order.
    pub fn pending(&self) -> Vec<TelemetryEntry> {
        self.entries.read().clone()
    }

    /// Pending entries grouped for the upload body:
    /// `plugin_id → artifact_id → [entries]`.
    pub fn pending_grouped(&self) -> BTreeMap<String, BTreeMap<String, Vec<TelemetryEntry>>> {
        let mut grouped: BTreeMap<String, BTreeMap<String, Vec<TelemetryEntry>>> = BTreeMap::new();
        for entry in self.entries.read().iter() {
            grouped
                .entry(entry.plugin_id.clone())
                .or_default()
                .entry(entry.artifact_id.clone())
                .or_default()
                .push(entry.clone());
        }
        grouped
    }

    /// Remove every entry under the acked keys. Acking a key with nothing
    /// queued is a no-op.
    pub fn ack(&self, keys: &[(String, String)]) -> Result<usize> {
        let key_set: HashSet<(&str, &str)> = keys
            .iter()
            .map(|(p, a)| (p.as_str(), a.as_str()))
            .collect();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| !key_set.contains(&(e.plugin_id.as_str(), e.artifact_id.as_str())));
        let removed = before - entries.len();
        if removed > 0 {
            fsio::atomic_write_json(&self.path, &*entries)?;
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(plugin: &str, artifact: &str, n: u64) -> TelemetryEntry {
        TelemetryEntry {
            plugin_id: plugin.into(),
            artifact_id: artifact.into(),
            ts: Utc::now(),
            payload: Some(serde_json::json!({ "n": n })),
            error: None,
            execution_ms: n,
        }
    }

    #[test]
    fn append_persists_before_returning() {
        let tmp = tempfile::tempdir().unwrap();
        let q = TelemetryQueue::open(tmp.path(), None).unwrap();
        q.append(entry("pl", "m1", 1)).unwrap();

        // A fresh open (simulated restart) sees the entry.
        let q2 = TelemetryQueue::open(tmp.path(), None).unwrap();
        assert_eq!(q2.len(), 1);
    }

    #[test]
    fn ack_removes_exactly_the_acked_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let q = TelemetryQueue::open(tmp.path(), None).unwrap();
        q.append(entry("pl", "m1", 1)).unwrap();
        q.append(entry("pl", "m1", 2)).unwrap();
        q.append(entry("pl", "m2", 3)).unwrap();

        let removed = q.ack(&[("pl".into(), "m1".into())]).unwrap();
        assert_eq!(removed, 2);
        let rest = q.pending();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].artifact_id, "m2");
    }

    #[test]
    fn re_ack_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let q = TelemetryQueue::open(tmp.path(), None).unwrap();
        q.append(entry("pl", "m1", 1)).unwrap();
        q.ack(&[("pl".into(), "m1".into())]).unwrap();
        assert_eq!(q.ack(&[("pl".into(), "m1".into())]).unwrap(), 0);
    }

    #[test]
    fn grouping_preserves_per_key_order() {
        let tmp = tempfile::tempdir().unwrap();
        let q = TelemetryQueue::open(tmp.path(), None).unwrap();
        q.append(entry("pl", "m1", 1)).unwrap();
        q.append(entry("pl", "m2", 2)).unwrap();
        q.append(entry("pl", "m1", 3)).unwrap();

        let grouped = q.pending_grouped();
        let m1 = &grouped["pl"]["m1"];
        assert_eq!(m1.len(), 2);
        assert_eq!(m1[0].execution_ms, 1);
        assert_eq!(m1[1].execution_ms, 3);
    }

    #[test]
    fn soft_cap_prunes_oldest() {
        let tmp = tempfile::tempdir().unwrap();
        let q = TelemetryQueue::open(tmp.path(), Some(2)).unwrap();
        q.append(entry("pl", "m1", 1)).unwrap();
        q.append(entry("pl", "m1", 2)).unwrap();
        q.append(entry("pl", "m1", 3)).unwrap();
        let pending = q.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].execution_ms, 2);
    }

    #[test]
    fn survives_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data-queue");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("pending.json"), "[{half-written").unwrap();
        let q = TelemetryQueue::open(tmp.path(), None).unwrap();
        assert!(q.is_empty());
        q.append(entry("pl", "m1", 1)).unwrap();
        assert_eq!(q.len(), 1);
    }
}
