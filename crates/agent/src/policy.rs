//! The policy engine: CRUD, schedule evaluation, reconciliation, and
//! violation report rate-limiting.
//!
//! The engine is the sole owner of the policy map. Every mutation writes
//! the full set back through the config store, so the cache survives
//! restarts and the agent can enforce offline.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use pw_domain::policy::Policy;
use pw_domain::{Error, Result};

use crate::config_store::ConfigStore;

/// Violation reports per policy are capped at one per this window;
/// terminations themselves are never suppressed.
pub const REPORT_INTERVAL_SECS: i64 = 60;

pub struct PolicyEngine {
    store: Arc<ConfigStore>,
    policies: RwLock<HashMap<String, Policy>>,
    last_report: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl PolicyEngine {
    /// Seed the map from the persisted cache.
    pub fn new(store: Arc<ConfigStore>) -> Self {
        let cached = store.snapshot().policies;
        tracing::info!(policies = cached.len(), "policy cache loaded");
        Self {
            store,
            policies: RwLock::new(cached.into_iter().map(|p| (p.id.clone(), p)).collect()),
            last_report: Mutex::new(HashMap::new()),
        }
    }

    // ── CRUD ─────────────────────────────────────────────────────────

    pub fn create(&self, mut policy: Policy) -> Result<()> {
        let mut map = self.policies.write();
        if map.contains_key(&policy.id) {
            return Err(Error::Config(format!("policy {} already exists", policy.id)));
        }
        let now = Utc::now();
        policy.created_ts.get_or_insert(now);
        policy.updated_ts = Some(now);
        map.insert(policy.id.clone(), policy);
        drop(map);
        self.persist()
    }

    /// Replace an existing policy. The id is immutable: `updated.id` must
    /// name a policy that already exists.
    pub fn update(&self, updated: Policy) -> Result<()> {
        let mut map = self.policies.write();
        let Some(existing) = map.get(&updated.id) else {
            return Err(Error::Config(format!("no policy with id {}", updated.id)));
        };
        let created_ts = existing.created_ts;
        let mut policy = updated;
        policy.created_ts = created_ts;
        policy.updated_ts = Some(Utc::now());
        map.insert(policy.id.clone(), policy);
        drop(map);
        self.persist()
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.policies.write().remove(id).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<Policy> {
        self.policies.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Policy> {
        let mut list: Vec<Policy> = self.policies.read().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn count(&self) -> usize {
        self.policies.read().len()
    }

    /// Policies whose schedule predicate holds at `t`.
    pub fn active_now<Tz: chrono::TimeZone>(&self, t: &DateTime<Tz>) -> Vec<Policy> {
        let mut list: Vec<Policy> = self
            .policies
            .read()
            .values()
            .filter(|p| p.active_at(t))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Full replacement from the controller: the remote list becomes the
    /// entire map (not a merge), then persists.
    pub fn reconcile(&self, remote: Vec<Policy>) -> Result<usize> {
        let count = remote.len();
        *self.policies.write() = remote.into_iter().map(|p| (p.id.clone(), p)).collect();
        self.persist()?;
        tracing::info!(policies = count, "policy set reconciled from controller");
        Ok(count)
    }

    // ── Violation reporting ──────────────────────────────────────────

    /// Whether a violation report for `policy_id` may be emitted at `now`.
    /// At most one report per policy per [`REPORT_INTERVAL_SECS`];
    /// recording happens here so callers cannot forget it.
    pub fn should_report(&self, policy_id: &str, now: DateTime<Utc>) -> bool {
        let mut last = self.last_report.lock();
        match last.get(policy_id) {
            Some(prev) if (now - *prev).num_seconds() < REPORT_INTERVAL_SECS => false,
            _ => {
                last.insert(policy_id.to_owned(), now);
                true
            }
        }
    }

    fn persist(&self) -> Result<()> {
        let list = self.all();
        self.store.update(|c| c.policies = list)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (PolicyEngine, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(&tmp.path().join("config.json")).unwrap();
        (PolicyEngine::new(store), tmp)
    }

    fn policy(id: &str, name: &str, allowed: bool) -> Policy {
        Policy {
            id: id.into(),
            process_name: name.into(),
            allowed,
            schedule: None,
            quotas: None,
            created_ts: None,
            updated_ts: None,
        }
    }

    #[test]
    fn crud_round_trip() {
        let (e, _tmp) = engine();
        e.create(policy("p1", "steam.exe", false)).unwrap();
        assert!(e.create(policy("p1", "other", true)).is_err());

        let mut p = e.get("p1").unwrap();
        assert_eq!(p.process_name, "steam.exe");
        p.allowed = true;
        e.update(p).unwrap();
        assert!(e.get("p1").unwrap().allowed);

        assert!(e.update(policy("ghost", "x", true)).is_err());
        assert!(e.delete("p1").unwrap());
        assert!(!e.delete("p1").unwrap());
    }

    #[test]
    fn update_preserves_created_ts() {
        let (e, _tmp) = engine();
        e.create(policy("p1", "steam.exe", false)).unwrap();
        let created = e.get("p1").unwrap().created_ts;
        e.update(policy("p1", "steam.exe", true)).unwrap();
        assert_eq!(e.get("p1").unwrap().created_ts, created);
    }

    #[test]
    fn mutations_persist_to_the_config_store() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        {
            let store = ConfigStore::load(&path).unwrap();
            let e = PolicyEngine::new(store);
            e.create(policy("p1", "steam.exe", false)).unwrap();
        }
        // A fresh engine over the same store sees the cache.
        let store = ConfigStore::load(&path).unwrap();
        let e = PolicyEngine::new(store);
        assert_eq!(e.count(), 1);
        assert_eq!(e.get("p1").unwrap().process_name, "steam.exe");
    }

    #[test]
    fn reconcile_is_full_replacement() {
        let (e, _tmp) = engine();
        e.create(policy("local", "notepad", true)).unwrap();
        let n = e
            .reconcile(vec![
                policy("p1", "steam.exe", false),
                policy("p2", "chrome.exe", true),
            ])
            .unwrap();
        assert_eq!(n, 2);
        // The locally-created policy is gone: reconcile replaces, never merges.
        assert!(e.get("local").is_none());
        assert_eq!(e.count(), 2);
    }

    #[test]
    fn report_rate_limit_is_per_policy_per_minute() {
        let (e, _tmp) = engine();
        let t0 = Utc::now();
        assert!(e.should_report("p1", t0));
        assert!(!e.should_report("p1", t0 + chrono::Duration::seconds(59)));
        // A different policy has its own window.
        assert!(e.should_report("p2", t0));
        // Window elapsed.
        assert!(e.should_report("p1", t0 + chrono::Duration::seconds(61)));
    }

    #[test]
    fn active_now_respects_schedules() {
        use chrono::TimeZone;
        use pw_domain::policy::PolicySchedule;

        let (e, _tmp) = engine();
        let mut scheduled = policy("p1", "steam.exe", false);
        scheduled.schedule = Some(PolicySchedule {
            start: "09:00".into(),
            end: "17:00".into(),
            days_of_week: vec![],
        });
        e.create(scheduled).unwrap();
        e.create(policy("p2", "chrome.exe", false)).unwrap();

        let noon = Utc.with_ymd_and_hms(2024, 1, 7, 12, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 1, 7, 2, 0, 0).unwrap();
        assert_eq!(e.active_now(&noon).len(), 2);
        let at_night = e.active_now(&night);
        assert_eq!(at_night.len(), 1);
        assert_eq!(at_night[0].id, "p2");
    }
}
