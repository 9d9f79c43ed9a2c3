//! Component wiring, the main sync loop, and graceful shutdown.
//!
//! One cycle of the main loop runs, in order: discovery (when no endpoint
//! is resolved) → controller verification → policy sync → heartbeat →
//! queue upload → command poll → sequential dispatch. The connection state
//! machine is fed by the sync outcome alone and dictates how long the loop
//! sleeps afterwards.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pw_domain::command::CommandResult;
use pw_domain::config::AgentConfig;
use pw_domain::{Error, Result};
use pw_os::{ProcessAdapter, SysinfoAdapter};
use pw_plugins::ExtensionManager;
use pw_queue::{ResponseQueue, TelemetryQueue};
use pw_scripthost::{
    ensure_harness, CapabilityBroker, CapabilityConfig, RunnerConfig, SubprocessEvaluator,
};

use crate::commands::CommandProcessor;
use crate::config_store::ConfigStore;
use crate::connection::{ConnectionHandle, ConnectionMachine};
use crate::controller::ControllerClient;
use crate::logging;
use crate::monitor::ProcessMonitor;
use crate::paths::AgentPaths;
use crate::policy::PolicyEngine;
use crate::status::{self, HelperCommand, StatusState};
use crate::updater::{LogOnlyLauncher, UpdateLauncher};
use crate::AGENT_VERSION;

/// Environment override for the script runner binary (default `node`).
const RUNNER_ENV: &str = "PW_SCRIPT_RUNNER";

/// Cadence of the background update check.
const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Bound on the graceful-shutdown tail.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// Start the agent and run until a shutdown signal. Returns the process
/// exit code: 0 for graceful shutdown (including updater takeover).
pub async fn run(paths: AgentPaths) -> anyhow::Result<i32> {
    // ── Config & identity ────────────────────────────────────────────
    let store = ConfigStore::load(&paths.config_file()).context("loading configuration")?;
    let config = store.snapshot();

    let _log_guard = logging::init_logging(&paths.log_dir(), &config.log_level)
        .context("initializing logging")?;
    tracing::info!(
        version = AGENT_VERSION,
        root = %paths.root().display(),
        "procwarden starting"
    );

    if config.agent_id.is_none() {
        let minted = uuid::Uuid::new_v4().to_string();
        store.update(|c| c.agent_id = Some(minted.clone()))?;
        tracing::info!(agent_id = %minted, "minted fresh agent id");
    }
    if config.machine_id.is_none() {
        let machine_id = pw_os::host::machine_id();
        store.update(|c| c.machine_id = Some(machine_id.clone()))?;
        tracing::info!(machine_id = %machine_id, "derived machine id");
    }
    let config = store.snapshot();

    // ── Components, leaf first ───────────────────────────────────────
    let adapter: Arc<dyn ProcessAdapter> = Arc::new(SysinfoAdapter::new());
    let telemetry = Arc::new(TelemetryQueue::open(paths.state_dir(), None)?);
    let responses = Arc::new(ResponseQueue::open(paths.state_dir(), None)?);

    let harness = ensure_harness(&paths.plugins_dir())?;
    let mut runner = RunnerConfig::node(&harness);
    if let Ok(custom) = std::env::var(RUNNER_ENV) {
        runner.command = custom;
    }
    let evaluator = Arc::new(SubprocessEvaluator::new(
        runner,
        CapabilityBroker::new(&CapabilityConfig::default()),
    ));

    let extensions = Arc::new(ExtensionManager::new(
        &paths.plugins_dir(),
        evaluator,
        telemetry.clone(),
        responses.clone(),
        adapter.clone(),
    )?);
    extensions.start();

    let engine = Arc::new(PolicyEngine::new(store.clone()));
    let connection = ConnectionHandle::new(ConnectionMachine::new(
        config.is_configured(),
        config.offline_mode_settings.clone(),
    ));
    let client = Arc::new(ControllerClient::new(store.clone(), AGENT_VERSION)?);

    let shutdown = CancellationToken::new();
    let updater: Arc<LogOnlyLauncher> = Arc::new(LogOnlyLauncher::new(shutdown.clone()));
    let processor = CommandProcessor::new(
        engine.clone(),
        extensions.clone(),
        store.clone(),
        updater.clone(),
    );

    // ── Observers & background tasks ─────────────────────────────────
    let monitoring_enabled = Arc::new(AtomicBool::new(true));
    let last_error = Arc::new(RwLock::new(None));
    let (helper_tx, helper_rx) = mpsc::channel(16);

    let status_state = StatusState {
        store: store.clone(),
        connection: connection.clone(),
        engine: engine.clone(),
        extensions: extensions.clone(),
        adapter: adapter.clone(),
        updater: updater.clone(),
        helper_tx,
        monitoring_enabled: monitoring_enabled.clone(),
        last_error: last_error.clone(),
        started_at: Instant::now(),
        version: AGENT_VERSION,
    };
    let (_, status_handle) = status::serve(status_state, config.status_port, shutdown.clone())
        .await
        .context("starting status server")?;

    let monitor = ProcessMonitor::new(
        engine.clone(),
        adapter.clone(),
        client.clone(),
        monitoring_enabled.clone(),
    );
    let monitor_handle = tokio::spawn(monitor.run(config.check_interval_ms, shutdown.clone()));

    let checker_handle = spawn_update_checker(store.clone(), updater.clone(), shutdown.clone());
    spawn_signal_handler(shutdown.clone());

    // ── Main loop ────────────────────────────────────────────────────
    let mut sync_loop = SyncLoop {
        store: store.clone(),
        engine,
        connection,
        client,
        processor,
        telemetry,
        responses,
        updater: updater.clone(),
        last_error,
        pending_results: Vec::new(),
    };
    sync_loop.run(helper_rx, shutdown.clone()).await;

    // ── Graceful shutdown ────────────────────────────────────────────
    tracing::info!("shutting down");
    checker_handle.abort();
    extensions.shutdown();
    let tail = async {
        let _ = monitor_handle.await;
        let _ = status_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, tail).await.is_err() {
        tracing::warn!("shutdown budget exceeded, exiting anyway");
    }
    tracing::info!("shutdown complete");
    Ok(0)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The sync loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SyncLoop {
    store: Arc<ConfigStore>,
    engine: Arc<PolicyEngine>,
    connection: ConnectionHandle,
    client: Arc<ControllerClient>,
    processor: CommandProcessor,
    telemetry: Arc<TelemetryQueue>,
    responses: Arc<ResponseQueue>,
    updater: Arc<dyn UpdateLauncher>,
    last_error: Arc<RwLock<Option<String>>>,
    /// Command results awaiting acknowledgment on the next poll.
    pending_results: Vec<CommandResult>,
}

impl SyncLoop {
    async fn run(
        &mut self,
        mut helper_rx: mpsc::Receiver<HelperCommand>,
        shutdown: CancellationToken,
    ) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            self.run_cycle().await;

            let interval = {
                let check_interval = self.store.snapshot().check_interval_ms;
                self.connection.with(|m| m.retry_interval(check_interval))
            };
            tracing::debug!(sleep_secs = interval.as_secs(), "sync cycle complete");

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => return,
                nudge = helper_rx.recv() => match nudge {
                    Some(HelperCommand::SyncNow) => {
                        tracing::info!("helper requested immediate sync");
                    }
                    Some(HelperCommand::RestartMonitoring) => {
                        tracing::info!("helper re-enabled monitoring");
                    }
                    Some(HelperCommand::CheckUpdate) => {
                        if let Some(info) = self.updater.check().await {
                            self.updater.notify(&info.version, info.url.as_deref());
                        }
                    }
                    None => {}
                },
            }
        }
    }

    /// One full sync cycle. Only the sync outcome feeds the state machine;
    /// later steps (heartbeat, upload, poll) log their own failures.
    async fn run_cycle(&mut self) {
        let config = self.store.snapshot();
        if !config.is_configured() {
            self.connection.with(|m| m.set_configured(false));
            tracing::debug!("agent not configured, idling");
            return;
        }
        self.connection.with(|m| m.set_configured(true));

        if self.client.endpoint().is_none() {
            match resolve_endpoint(&config).await {
                Ok(endpoint) => {
                    self.client.set_endpoint(endpoint);
                    self.client.invalidate_verification();
                }
                Err(e) => {
                    self.note_failure(e);
                    return;
                }
            }
        }

        let outcome = match self.client.sync_policies().await {
            Ok(outcome) => outcome,
            Err(e) => {
                // A dead endpoint should not be retried forever; let the
                // next cycle re-discover.
                if matches!(e, Error::Transport(_))
                    || matches!(
                        e,
                        Error::ParentUnverified(pw_domain::VerifyDenied::NetworkError)
                    )
                {
                    self.client.clear_endpoint();
                }
                self.note_failure(e);
                return;
            }
        };

        if let Err(e) = self.engine.reconcile(outcome.policies) {
            tracing::error!(error = %e, "failed to persist reconciled policies");
        }
        if let Some(settings) = outcome.offline_mode_settings {
            self.connection.with(|m| m.apply_settings(settings.clone()));
            if let Err(e) = self.store.update(|c| c.offline_mode_settings = settings) {
                tracing::warn!(error = %e, "failed to persist offline-mode settings");
            }
        }

        let now = Utc::now();
        let transition = self.connection.with(|m| m.record_success(now));
        self.persist_connection(|c| c.last_sync_ts = Some(now));
        *self.last_error.write() = None;

        // Heartbeat, carrying offline-recovery metadata when this sync
        // ended an offline period.
        let mut metadata = serde_json::json!({
            "policy_count": self.engine.count(),
            "queued_telemetry": self.telemetry.len(),
            "queued_responses": self.responses.len(),
        });
        if let Some(offline) = transition.recovered_after {
            metadata["offline_recovery"] = serde_json::json!(true);
            metadata["offline_duration_secs"] = serde_json::json!(offline.as_secs());
        }
        if let Err(e) = self.client.heartbeat(metadata).await {
            tracing::warn!(error = %e, "heartbeat failed");
        }

        self.upload_queues().await;
        self.poll_and_dispatch().await;
    }

    async fn upload_queues(&self) {
        if self.telemetry.is_empty() && self.responses.is_empty() {
            return;
        }
        let grouped = self.telemetry.pending_grouped();
        let keys: Vec<(String, String)> = grouped
            .iter()
            .flat_map(|(plugin, artifacts)| {
                artifacts
                    .keys()
                    .map(move |artifact| (plugin.clone(), artifact.clone()))
            })
            .collect();
        let pending_responses = self.responses.pending();
        let trigger_ids: Vec<String> = pending_responses
            .iter()
            .map(|r| r.trigger_id.clone())
            .collect();

        let plugin_data = match serde_json::to_value(&grouped) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize telemetry batch");
                return;
            }
        };

        match self
            .client
            .upload_plugin_data(plugin_data, &pending_responses)
            .await
        {
            Ok(()) => {
                if let Err(e) = self.telemetry.ack(&keys) {
                    tracing::error!(error = %e, "telemetry ack failed");
                }
                if let Err(e) = self.responses.ack(&trigger_ids) {
                    tracing::error!(error = %e, "response ack failed");
                }
                tracing::info!(
                    telemetry_keys = keys.len(),
                    responses = trigger_ids.len(),
                    "plugin data uploaded"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "plugin data upload failed, queues retained");
            }
        }
    }

    async fn poll_and_dispatch(&mut self) {
        let results = std::mem::take(&mut self.pending_results);
        match self.client.poll_commands(&results).await {
            Ok(commands) => {
                if commands.is_empty() {
                    return;
                }
                tracing::info!(commands = commands.len(), "dispatching command batch");
                self.pending_results = self.processor.process_batch(commands).await;
            }
            Err(e) => {
                // Keep the results for the next poll so the controller
                // still learns the outcomes.
                self.pending_results = results;
                tracing::warn!(error = %e, "command poll failed");
            }
        }
    }

    fn note_failure(&self, error: Error) {
        match &error {
            Error::ParentUnverified(reason) => {
                tracing::error!(reason = %reason, "controller verification failed, sync aborted");
            }
            other => {
                tracing::warn!(error = %other, "sync attempt failed");
            }
        }
        *self.last_error.write() = Some(error_category(&error).to_owned());
        self.connection.with(|m| m.record_failure(Utc::now()));
        self.persist_connection(|_| {});
    }

    fn persist_connection(&self, also: impl FnOnce(&mut AgentConfig)) {
        let snapshot = self.connection.snapshot();
        if let Err(e) = self.store.update(|c| {
            c.connection_state = snapshot.clone();
            also(c);
        }) {
            tracing::warn!(error = %e, "failed to persist connection state");
        }
    }
}

/// Resolve the controller endpoint: an explicitly configured host wins;
/// otherwise browse the LAN for the configured identifier.
async fn resolve_endpoint(config: &AgentConfig) -> Result<pw_discovery::Endpoint> {
    if let Some(host) = config.controller_host.as_deref().filter(|h| !h.is_empty()) {
        return Ok(pw_discovery::Endpoint {
            host: host.to_owned(),
            port: config.controller_port,
        });
    }
    if !config.enable_discovery {
        return Err(Error::Unconfigured(
            "no controller host configured and discovery is disabled".into(),
        ));
    }
    let identifier = config
        .controller_identifier
        .as_deref()
        .ok_or_else(|| Error::Unconfigured("missing controller identifier".into()))?;
    pw_discovery::find_controller(identifier, pw_discovery::DEFAULT_WINDOW).await
}

/// Compact failure category for the status surface.
fn error_category(error: &Error) -> &'static str {
    match error {
        Error::ParentUnverified(_) => "parent_unverified",
        Error::ControllerNotFound(_) => "controller_not_found",
        Error::DiscoveryUnavailable(_) => "discovery_unavailable",
        Error::Transport(_) => "transport",
        Error::Protocol(_) => "protocol",
        Error::Unconfigured(_) => "unconfigured",
        _ => "internal",
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, using ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn spawn_update_checker(
    store: Arc<ConfigStore>,
    updater: Arc<dyn UpdateLauncher>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(UPDATE_CHECK_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !store.snapshot().auto_update {
                        continue;
                    }
                    if let Some(info) = updater.check().await {
                        updater.notify(&info.version, info.url.as_deref());
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    })
}
