//! The enforcement ticker: evaluates active policies against the live
//! process table and terminates violators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use tokio_util::sync::CancellationToken;

use pw_domain::config::MIN_CHECK_INTERVAL_MS;
use pw_domain::violation::Violation;
use pw_domain::Result;
use pw_os::ProcessAdapter;

use crate::policy::PolicyEngine;

/// Where violation reports go. Implemented by the controller client; tests
/// substitute a recorder.
#[async_trait]
pub trait ViolationSink: Send + Sync {
    async fn report_violation(&self, violation: &Violation) -> Result<()>;
}

pub struct ProcessMonitor {
    engine: Arc<PolicyEngine>,
    adapter: Arc<dyn ProcessAdapter>,
    sink: Arc<dyn ViolationSink>,
    enabled: Arc<AtomicBool>,
}

impl ProcessMonitor {
    pub fn new(
        engine: Arc<PolicyEngine>,
        adapter: Arc<dyn ProcessAdapter>,
        sink: Arc<dyn ViolationSink>,
        enabled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            engine,
            adapter,
            sink,
            enabled,
        }
    }

    /// Run the ticker until `shutdown` fires. The interval is clamped to
    /// the 5-second floor; configuring anything lower is rejected upstream.
    pub async fn run(self, check_interval_ms: u64, shutdown: CancellationToken) {
        let period = Duration::from_millis(check_interval_ms.max(MIN_CHECK_INTERVAL_MS));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(period_ms = period.as_millis() as u64, "process monitor started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.enabled.load(Ordering::Relaxed) {
                        self.tick().await;
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("process monitor stopped");
                    return;
                }
            }
        }
    }

    /// One enforcement pass. Adapter errors skip the affected policy; a
    /// report is emitted at most once per policy per minute while
    /// terminations continue unconditionally.
    pub async fn tick(&self) {
        let now_local = Local::now();
        for policy in self.engine.active_now(&now_local) {
            if policy.allowed {
                continue;
            }
            let running = match self.adapter.find_by_name(&policy.process_name) {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(
                        policy_id = %policy.id,
                        process_name = %policy.process_name,
                        error = %e,
                        "process lookup failed, skipping policy this tick"
                    );
                    continue;
                }
            };
            if running.is_empty() {
                continue;
            }

            let terminated = match self.adapter.terminate_by_name(&policy.process_name) {
                Ok(list) => list,
                Err(e) => {
                    tracing::error!(
                        policy_id = %policy.id,
                        process_name = %policy.process_name,
                        error = %e,
                        "termination failed"
                    );
                    continue;
                }
            };
            if terminated.is_empty() {
                continue;
            }
            tracing::warn!(
                policy_id = %policy.id,
                process_name = %policy.process_name,
                terminated = terminated.len(),
                "policy violation enforced"
            );

            if self.engine.should_report(&policy.id, chrono::Utc::now()) {
                let violation = Violation::terminated(
                    &policy.id,
                    &policy.process_name,
                    serde_json::to_value(&terminated).unwrap_or_default(),
                );
                if let Err(e) = self.sink.report_violation(&violation).await {
                    tracing::debug!(
                        policy_id = %policy.id,
                        error = %e,
                        "violation report deferred (controller unreachable)"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pw_domain::policy::Policy;
    use pw_os::ProcessInfo;

    use crate::config_store::ConfigStore;

    struct ScriptedAdapter {
        running: Mutex<Vec<ProcessInfo>>,
        terminations: Mutex<Vec<String>>,
    }

    impl ScriptedAdapter {
        fn with(names: &[&str]) -> Self {
            Self {
                running: Mutex::new(
                    names
                        .iter()
                        .enumerate()
                        .map(|(i, n)| ProcessInfo {
                            pid: 100 + i as u32,
                            name: (*n).to_owned(),
                            exe: None,
                            memory_bytes: 0,
                        })
                        .collect(),
                ),
                terminations: Mutex::new(Vec::new()),
            }
        }
    }

    impl ProcessAdapter for ScriptedAdapter {
        fn processes(&self) -> Result<Vec<ProcessInfo>> {
            Ok(self.running.lock().clone())
        }

        fn terminate_pid(&self, pid: u32) -> Result<bool> {
            let mut running = self.running.lock();
            let before = running.len();
            running.retain(|p| p.pid != pid);
            Ok(running.len() < before)
        }

        fn terminate_by_name(&self, name: &str) -> Result<Vec<ProcessInfo>> {
            self.terminations.lock().push(name.to_owned());
            let mut running = self.running.lock();
            let (gone, keep): (Vec<_>, Vec<_>) = running
                .drain(..)
                .partition(|p| pw_os::names_match(&p.name, name));
            *running = keep;
            Ok(gone)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        reports: Mutex<Vec<Violation>>,
    }

    #[async_trait]
    impl ViolationSink for RecordingSink {
        async fn report_violation(&self, violation: &Violation) -> Result<()> {
            self.reports.lock().push(violation.clone());
            Ok(())
        }
    }

    fn rig(names: &[&str]) -> (ProcessMonitor, Arc<ScriptedAdapter>, Arc<RecordingSink>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(&tmp.path().join("config.json")).unwrap();
        let engine = Arc::new(PolicyEngine::new(store));
        let adapter = Arc::new(ScriptedAdapter::with(names));
        let sink = Arc::new(RecordingSink::default());
        let monitor = ProcessMonitor::new(
            engine.clone(),
            adapter.clone(),
            sink.clone(),
            Arc::new(AtomicBool::new(true)),
        );
        // Hand the engine back through the monitor's Arc for test setup.
        (monitor, adapter, sink, tmp)
    }

    fn deny(id: &str, name: &str) -> Policy {
        Policy {
            id: id.into(),
            process_name: name.into(),
            allowed: false,
            schedule: None,
            quotas: None,
            created_ts: None,
            updated_ts: None,
        }
    }

    #[tokio::test]
    async fn violating_process_is_terminated_and_reported() {
        let (monitor, adapter, sink, _tmp) = rig(&["Steam.exe", "init"]);
        monitor.engine.create(deny("p1", "steam.exe")).unwrap();

        monitor.tick().await;

        assert_eq!(adapter.terminations.lock().as_slice(), ["steam.exe"]);
        assert!(adapter.processes().unwrap().iter().all(|p| p.name == "init"));
        let reports = sink.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].policy_id, "p1");
        assert_eq!(reports[0].action, "terminated");
    }

    #[tokio::test]
    async fn allowed_policies_are_left_alone() {
        let (monitor, adapter, sink, _tmp) = rig(&["chrome.exe"]);
        monitor
            .engine
            .create(Policy {
                allowed: true,
                ..deny("p1", "chrome.exe")
            })
            .unwrap();

        monitor.tick().await;
        assert!(adapter.terminations.lock().is_empty());
        assert!(sink.reports.lock().is_empty());
    }

    #[tokio::test]
    async fn repeat_violations_within_a_minute_are_not_rereported() {
        let (monitor, adapter, sink, _tmp) = rig(&["steam.exe"]);
        monitor.engine.create(deny("p1", "steam.exe")).unwrap();

        monitor.tick().await;
        // The process respawns immediately.
        adapter.running.lock().push(ProcessInfo {
            pid: 999,
            name: "steam.exe".into(),
            exe: None,
            memory_bytes: 0,
        });
        monitor.tick().await;

        // Terminated twice, reported once.
        assert_eq!(adapter.terminations.lock().len(), 2);
        assert_eq!(sink.reports.lock().len(), 1);
    }

    #[tokio::test]
    async fn absent_process_does_nothing() {
        let (monitor, adapter, sink, _tmp) = rig(&["init"]);
        monitor.engine.create(deny("p1", "steam.exe")).unwrap();
        monitor.tick().await;
        assert!(adapter.terminations.lock().is_empty());
        assert!(sink.reports.lock().is_empty());
    }
}
