//! The extension manager proper.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use pw_domain::artifact::ScriptArtifact;
use pw_domain::plugin_data::{ActionResponse, ActionStatus, TelemetryEntry};
use pw_domain::{Error, Result};
use pw_os::ProcessAdapter;
use pw_queue::{fsio, ResponseQueue, TelemetryQueue};
use pw_scripthost::{EvalContext, ScriptEvaluator};

use crate::shutdown::{ShutdownSchedule, ShutdownSpec, ShutdownView};

/// Monitors may not tick faster than this.
const MIN_MONITOR_INTERVAL_MS: u64 = 1_000;

/// Debounce applied after each action response, batching the flush log.
const RESPONSE_DEBOUNCE: Duration = Duration::from_secs(2);

/// Action ids the manager implements natively rather than via script.
const ACTION_SCHEDULE_SHUTDOWN: &str = "schedule-shutdown";
const ACTION_CANCEL_SHUTDOWN: &str = "cancel-shutdown";

type Key = (String, String);

/// Everything needed to deploy one artifact; built from the corresponding
/// controller command.
#[derive(Debug, Clone)]
pub struct DeploySpec {
    pub plugin_id: String,
    pub artifact_id: String,
    /// Base64-encoded script text.
    pub source_b64: String,
    pub platforms: Vec<String>,
    /// Expected SHA-256 hex digest of the decoded text.
    pub checksum: String,
    /// Monitors only.
    pub interval_ms: Option<u64>,
}

/// Owns the monitor/action registries, their timers, and the pending
/// scheduled shutdown.
pub struct ExtensionManager {
    plugins_dir: PathBuf,
    evaluator: Arc<dyn ScriptEvaluator>,
    telemetry: Arc<TelemetryQueue>,
    responses: Arc<ResponseQueue>,
    adapter: Arc<dyn ProcessAdapter>,

    monitors: RwLock<HashMap<Key, ScriptArtifact>>,
    actions: RwLock<HashMap<Key, ScriptArtifact>>,
    timers: Mutex<HashMap<Key, JoinHandle<()>>>,
    debounce: Mutex<Option<JoinHandle<()>>>,
    shutdown_schedule: Mutex<ShutdownSchedule>,

    platform: String,
    arch: String,
    hostname: String,
    username: String,
}

impl ExtensionManager {
    /// Load registries from `plugins_dir` (`monitors.json` / `actions.json`).
    /// Timers are not started here; call [`start`](Self::start) once the
    /// manager is wrapped in an `Arc`.
    pub fn new(
        plugins_dir: &Path,
        evaluator: Arc<dyn ScriptEvaluator>,
        telemetry: Arc<TelemetryQueue>,
        responses: Arc<ResponseQueue>,
        adapter: Arc<dyn ProcessAdapter>,
    ) -> Result<Self> {
        std::fs::create_dir_all(plugins_dir)?;
        let monitors: Vec<ScriptArtifact> =
            fsio::load_json_or_default(&plugins_dir.join("monitors.json"), Vec::new());
        let actions: Vec<ScriptArtifact> =
            fsio::load_json_or_default(&plugins_dir.join("actions.json"), Vec::new());
        tracing::info!(
            monitors = monitors.len(),
            actions = actions.len(),
            path = %plugins_dir.display(),
            "plugin registries loaded"
        );
        Ok(Self {
            plugins_dir: plugins_dir.to_path_buf(),
            evaluator,
            telemetry,
            responses,
            adapter,
            monitors: RwLock::new(monitors.into_iter().map(|a| (a.key(), a)).collect()),
            actions: RwLock::new(actions.into_iter().map(|a| (a.key(), a)).collect()),
            timers: Mutex::new(HashMap::new()),
            debounce: Mutex::new(None),
            shutdown_schedule: Mutex::new(ShutdownSchedule::default()),
            platform: pw_os::host::platform().to_owned(),
            arch: pw_os::host::arch().to_owned(),
            hostname: pw_os::host::hostname(),
            username: pw_os::host::username(),
        })
    }

    /// Start interval timers for every monitor loaded from disk.
    pub fn start(self: &Arc<Self>) {
        let keys: Vec<Key> = self.monitors.read().keys().cloned().collect();
        for key in keys {
            self.start_monitor_timer(&key);
        }
    }

    // ── Deployment ───────────────────────────────────────────────────

    /// Validate and store a monitor, replacing any prior artifact with the
    /// same `(plugin_id, artifact_id)` and restarting its timer.
    pub fn deploy_monitor(self: &Arc<Self>, spec: DeploySpec) -> Result<()> {
        let interval_ms = spec
            .interval_ms
            .ok_or_else(|| Error::Protocol("monitor deployment without interval_ms".into()))?;
        let artifact = self.validate(spec, Some(interval_ms))?;
        let key = artifact.key();

        self.stop_timer(&key);
        self.monitors.write().insert(key.clone(), artifact);
        self.persist_monitors()?;
        self.start_monitor_timer(&key);
        tracing::info!(plugin_id = %key.0, artifact_id = %key.1, interval_ms, "monitor deployed");
        Ok(())
    }

    /// Validate and store an action. Actions have no timer.
    pub fn deploy_action(self: &Arc<Self>, spec: DeploySpec) -> Result<()> {
        let artifact = self.validate(spec, None)?;
        let key = artifact.key();
        self.actions.write().insert(key.clone(), artifact);
        self.persist_actions()?;
        tracing::info!(plugin_id = %key.0, artifact_id = %key.1, "action deployed");
        Ok(())
    }

    /// Shared deployment validation: platform support, base64 decode,
    /// checksum equality. Nothing is stored when any step fails.
    fn validate(&self, spec: DeploySpec, interval_ms: Option<u64>) -> Result<ScriptArtifact> {
        // An empty platform list means "everywhere".
        if !spec.platforms.is_empty()
            && !spec.platforms.iter().any(|p| p.eq_ignore_ascii_case(&self.platform))
        {
            return Err(Error::UnsupportedPlatform {
                current: self.platform.clone(),
                supported: spec.platforms,
            });
        }

        let decoded = BASE64
            .decode(spec.source_b64.trim())
            .map_err(|e| Error::InvalidEncoding(format!("script source is not base64: {e}")))?;
        let source = String::from_utf8(decoded)
            .map_err(|_| Error::InvalidEncoding("script source is not UTF-8".into()))?;

        let actual = hex::encode(Sha256::digest(source.as_bytes()));
        if !actual.eq_ignore_ascii_case(spec.checksum.trim()) {
            return Err(Error::ChecksumMismatch {
                expected: spec.checksum,
                actual,
            });
        }

        Ok(ScriptArtifact {
            plugin_id: spec.plugin_id,
            artifact_id: spec.artifact_id,
            source,
            platforms: spec.platforms,
            checksum: actual,
            interval_ms: interval_ms.map(|ms| ms.max(MIN_MONITOR_INTERVAL_MS)),
            deployed_ts: Utc::now(),
        })
    }

    // ── Removal ──────────────────────────────────────────────────────

    /// Stop the timer and drop the monitor. Returns whether it existed.
    pub fn remove_monitor(&self, plugin_id: &str, artifact_id: &str) -> Result<bool> {
        let key = (plugin_id.to_owned(), artifact_id.to_owned());
        self.stop_timer(&key);
        let removed = self.monitors.write().remove(&key).is_some();
        if removed {
            self.persist_monitors()?;
            tracing::info!(plugin_id, artifact_id, "monitor removed");
        }
        Ok(removed)
    }

    pub fn remove_action(&self, plugin_id: &str, artifact_id: &str) -> Result<bool> {
        let key = (plugin_id.to_owned(), artifact_id.to_owned());
        let removed = self.actions.write().remove(&key).is_some();
        if removed {
            self.persist_actions()?;
            tracing::info!(plugin_id, artifact_id, "action removed");
        }
        Ok(removed)
    }

    // ── Monitors ─────────────────────────────────────────────────────

    fn start_monitor_timer(self: &Arc<Self>, key: &Key) {
        let Some(interval_ms) = self
            .monitors
            .read()
            .get(key)
            .and_then(|a| a.interval_ms)
        else {
            return;
        };
        let manager = Arc::clone(self);
        let key_owned = key.clone();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(interval_ms.max(MIN_MONITOR_INTERVAL_MS)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately; skip it
            // so deployment does not double-run fresh monitors.
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.run_monitor_tick(&key_owned).await;
            }
        });
        if let Some(old) = self.timers.lock().insert(key.clone(), handle) {
            old.abort();
        }
    }

    fn stop_timer(&self, key: &Key) {
        if let Some(handle) = self.timers.lock().remove(key) {
            handle.abort();
        }
    }

    /// One monitor execution. Errors become telemetry entries; they never
    /// stop the ticker.
    pub async fn run_monitor_tick(&self, key: &Key) {
        let Some(artifact) = self.monitors.read().get(key).cloned() else {
            return;
        };
        let ctx = self.eval_context(&artifact.plugin_id, &artifact.artifact_id);
        let started = std::time::Instant::now();
        let outcome = self
            .evaluator
            .evaluate(&artifact.source, &serde_json::json!({}), &ctx)
            .await;
        let execution_ms = started.elapsed().as_millis() as u64;

        let entry = match outcome {
            Ok(payload) => TelemetryEntry {
                plugin_id: artifact.plugin_id.clone(),
                artifact_id: artifact.artifact_id.clone(),
                ts: Utc::now(),
                payload: Some(payload),
                error: None,
                execution_ms,
            },
            Err(e) => {
                tracing::warn!(
                    plugin_id = %artifact.plugin_id,
                    artifact_id = %artifact.artifact_id,
                    category = e.category().as_str(),
                    error = %e,
                    "monitor tick failed"
                );
                TelemetryEntry {
                    plugin_id: artifact.plugin_id.clone(),
                    artifact_id: artifact.artifact_id.clone(),
                    ts: Utc::now(),
                    payload: None,
                    error: Some(format!("[{}] {e}", e.category().as_str())),
                    execution_ms,
                }
            }
        };
        if let Err(e) = self.telemetry.append(entry) {
            tracing::error!(error = %e, "failed to enqueue monitor output");
        }
    }

    // ── Actions ──────────────────────────────────────────────────────

    /// Run an action for the given trigger.
    ///
    /// Always queues exactly one response per `trigger_id` — either now
    /// (ordinary actions, unknown actions, `cancel-shutdown`) or at the
    /// scheduled instant (`schedule-shutdown`). Returns the immediate
    /// response when one was produced.
    pub async fn trigger_action(
        self: &Arc<Self>,
        trigger_id: &str,
        plugin_id: &str,
        action_id: &str,
        args: &serde_json::Value,
    ) -> Result<Option<ActionResponse>> {
        // Native action patterns, available even with nothing deployed and
        // fully offline.
        match action_id {
            ACTION_SCHEDULE_SHUTDOWN => {
                let spec = ShutdownSpec::from_args(args)
                    .map_err(|e| Error::Protocol(format!("schedule-shutdown: {e}")))?;
                self.schedule_shutdown(trigger_id, plugin_id, spec);
                return Ok(None);
            }
            ACTION_CANCEL_SHUTDOWN => {
                let cancelled = self.cancel_shutdown();
                let response = ActionResponse {
                    trigger_id: trigger_id.to_owned(),
                    plugin_id: plugin_id.to_owned(),
                    action_id: action_id.to_owned(),
                    status: ActionStatus::Success,
                    return_code: 0,
                    output: Some(serde_json::json!({ "cancelled": cancelled })),
                    error: None,
                    executed_ts: Utc::now(),
                    execution_ms: 0,
                };
                self.queue_response(response.clone())?;
                return Ok(Some(response));
            }
            _ => {}
        }

        let key = (plugin_id.to_owned(), action_id.to_owned());
        let Some(artifact) = self.actions.read().get(&key).cloned() else {
            let response = ActionResponse::not_deployed(trigger_id, plugin_id, action_id);
            self.queue_response(response.clone())?;
            return Ok(Some(response));
        };

        let ctx = self.eval_context(plugin_id, action_id);
        let started = std::time::Instant::now();
        let outcome = self.evaluator.evaluate(&artifact.source, args, &ctx).await;
        let execution_ms = started.elapsed().as_millis() as u64;

        let response = match outcome {
            Ok(output) => ActionResponse {
                trigger_id: trigger_id.to_owned(),
                plugin_id: plugin_id.to_owned(),
                action_id: action_id.to_owned(),
                status: ActionStatus::Success,
                return_code: 0,
                output: Some(output),
                error: None,
                executed_ts: Utc::now(),
                execution_ms,
            },
            Err(e) => ActionResponse {
                trigger_id: trigger_id.to_owned(),
                plugin_id: plugin_id.to_owned(),
                action_id: action_id.to_owned(),
                status: ActionStatus::Failure,
                return_code: -1,
                output: None,
                error: Some(format!("[{}] {e}", e.category().as_str())),
                executed_ts: Utc::now(),
                execution_ms,
            },
        };
        self.queue_response(response.clone())?;
        Ok(Some(response))
    }

    /// Append to the response queue and rearm the 2 s debounce. The
    /// debounce only batches the flush log; delivery happens on the next
    /// upload regardless.
    fn queue_response(self: &Arc<Self>, response: ActionResponse) -> Result<()> {
        self.responses.append(response)?;
        let responses = Arc::clone(&self.responses);
        let mut debounce = self.debounce.lock();
        if let Some(old) = debounce.take() {
            old.abort();
        }
        *debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(RESPONSE_DEBOUNCE).await;
            tracing::debug!(pending = responses.len(), "action responses ready for upload");
        }));
        Ok(())
    }

    // ── Scheduled shutdown ───────────────────────────────────────────

    /// Arm warning and termination timers for a controller-scheduled
    /// shutdown. Replaces any prior schedule. The instants are armed
    /// locally, so a network loss after this point changes nothing.
    pub fn schedule_shutdown(self: &Arc<Self>, trigger_id: &str, plugin_id: &str, spec: ShutdownSpec) {
        let mut schedule = self.shutdown_schedule.lock();
        schedule.cancel();
        schedule.arm(self, trigger_id, plugin_id, spec);
    }

    /// Clear all pending shutdown timers. Returns whether one was armed.
    pub fn cancel_shutdown(&self) -> bool {
        self.shutdown_schedule.lock().cancel()
    }

    /// Pending shutdown, for the status surface.
    pub fn pending_shutdown(&self) -> Option<ShutdownView> {
        self.shutdown_schedule.lock().view()
    }

    /// Invoked by the termination timer.
    pub(crate) fn execute_shutdown(
        self: &Arc<Self>,
        trigger_id: &str,
        plugin_id: &str,
        spec: &ShutdownSpec,
    ) {
        let started = std::time::Instant::now();
        let result = self.adapter.terminate_by_name(&spec.process_name);
        let response = match result {
            Ok(terminated) => {
                tracing::warn!(
                    process_name = %spec.process_name,
                    terminated = terminated.len(),
                    reason = %spec.reason,
                    "scheduled shutdown executed"
                );
                ActionResponse {
                    trigger_id: trigger_id.to_owned(),
                    plugin_id: plugin_id.to_owned(),
                    action_id: ACTION_SCHEDULE_SHUTDOWN.to_owned(),
                    status: ActionStatus::Success,
                    return_code: 0,
                    output: Some(serde_json::json!({
                        "terminated": terminated.len(),
                        "process_name": spec.process_name,
                        "reason": spec.reason,
                    })),
                    error: None,
                    executed_ts: Utc::now(),
                    execution_ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(e) => ActionResponse {
                trigger_id: trigger_id.to_owned(),
                plugin_id: plugin_id.to_owned(),
                action_id: ACTION_SCHEDULE_SHUTDOWN.to_owned(),
                status: ActionStatus::Failure,
                return_code: -1,
                output: None,
                error: Some(e.to_string()),
                executed_ts: Utc::now(),
                execution_ms: started.elapsed().as_millis() as u64,
            },
        };
        if let Err(e) = self.queue_response(response) {
            tracing::error!(error = %e, "failed to queue shutdown response");
        }
        self.shutdown_schedule.lock().clear_after_fire();
    }

    // ── Introspection & shutdown ─────────────────────────────────────

    pub fn monitor_count(&self) -> usize {
        self.monitors.read().len()
    }

    pub fn action_count(&self) -> usize {
        self.actions.read().len()
    }

    pub fn monitors(&self) -> Vec<ScriptArtifact> {
        self.monitors.read().values().cloned().collect()
    }

    pub fn actions(&self) -> Vec<ScriptArtifact> {
        self.actions.read().values().cloned().collect()
    }

    /// Abort every timer: monitor tickers, the debounce, and any pending
    /// shutdown schedule. Registries and queues are already on disk.
    pub fn shutdown(&self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
        if let Some(handle) = self.debounce.lock().take() {
            handle.abort();
        }
        self.shutdown_schedule.lock().cancel();
        tracing::info!("extension manager stopped");
    }

    fn eval_context(&self, plugin_id: &str, artifact_id: &str) -> EvalContext {
        EvalContext {
            plugin_id: plugin_id.to_owned(),
            artifact_id: artifact_id.to_owned(),
            platform: self.platform.clone(),
            arch: self.arch.clone(),
            hostname: self.hostname.clone(),
            username: self.username.clone(),
        }
    }

    fn persist_monitors(&self) -> Result<()> {
        let list: Vec<ScriptArtifact> = self.monitors.read().values().cloned().collect();
        fsio::atomic_write_json(&self.plugins_dir.join("monitors.json"), &list)
    }

    fn persist_actions(&self) -> Result<()> {
        let list: Vec<ScriptArtifact> = self.actions.read().values().cloned().collect();
        fsio::atomic_write_json(&self.plugins_dir.join("actions.json"), &list)
    }
}
