//! Command dispatch: the agent's only ingress from the controller.
//!
//! Commands arrive as a pulled batch and are dispatched strictly in batch
//! order. A bounded idempotency ring deduplicates controller retries:
//! re-delivery of a processed id acknowledges `{skipped: true}` and has no
//! side effects.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use pw_domain::command::{Command, CommandKind, CommandResult};
use pw_domain::config::AgentConfig;
use pw_plugins::{DeploySpec, ExtensionManager};

use crate::config_store::ConfigStore;
use crate::policy::PolicyEngine;
use crate::updater::UpdateLauncher;

/// Ring capacity; when full the oldest half is pruned.
const IDEMPOTENCY_CAPACITY: usize = 1_000;
const IDEMPOTENCY_PRUNE_TO: usize = 500;

/// Insertion-ordered set of recently processed command ids.
struct IdempotencySet {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl IdempotencySet {
    fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(IDEMPOTENCY_CAPACITY),
            seen: HashSet::with_capacity(IDEMPOTENCY_CAPACITY),
        }
    }

    /// Record `id`; returns `false` when it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= IDEMPOTENCY_CAPACITY {
            while self.order.len() > IDEMPOTENCY_PRUNE_TO {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        self.order.push_back(id.to_owned());
        self.seen.insert(id.to_owned());
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

pub struct CommandProcessor {
    idempotency: Mutex<IdempotencySet>,
    engine: Arc<PolicyEngine>,
    extensions: Arc<ExtensionManager>,
    store: Arc<ConfigStore>,
    updater: Arc<dyn UpdateLauncher>,
}

impl CommandProcessor {
    pub fn new(
        engine: Arc<PolicyEngine>,
        extensions: Arc<ExtensionManager>,
        store: Arc<ConfigStore>,
        updater: Arc<dyn UpdateLauncher>,
    ) -> Self {
        Self {
            idempotency: Mutex::new(IdempotencySet::new()),
            engine,
            extensions,
            store,
            updater,
        }
    }

    /// Dispatch a batch strictly in order, one result per command.
    pub async fn process_batch(&self, commands: Vec<Command>) -> Vec<CommandResult> {
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            results.push(self.dispatch(command).await);
        }
        results
    }

    pub async fn dispatch(&self, command: Command) -> CommandResult {
        let id = command.id.clone();
        if !self.idempotency.lock().insert(&id) {
            tracing::info!(command_id = %id, "duplicate command skipped");
            return CommandResult::skipped(&id);
        }

        tracing::debug!(command_id = %id, "dispatching command");
        match self.execute(&id, command.kind).await {
            Ok(result) => CommandResult::ok(&id, result),
            Err(e) => {
                tracing::error!(command_id = %id, error = %e, "command failed");
                CommandResult::failed(&id, e.to_string())
            }
        }
    }

    async fn execute(
        &self,
        command_id: &str,
        kind: CommandKind,
    ) -> pw_domain::Result<serde_json::Value> {
        match kind {
            CommandKind::PolicyUpdate { policies } => {
                let applied = self.engine.reconcile(policies)?;
                Ok(serde_json::json!({ "applied": applied }))
            }

            CommandKind::DeployMonitor {
                plugin_id,
                monitor_id,
                source,
                platforms,
                checksum,
                interval_ms,
            } => {
                self.extensions.deploy_monitor(DeploySpec {
                    plugin_id: plugin_id.clone(),
                    artifact_id: monitor_id.clone(),
                    source_b64: source,
                    platforms,
                    checksum,
                    interval_ms: Some(interval_ms),
                })?;
                Ok(serde_json::json!({ "deployed": format!("{plugin_id}/{monitor_id}") }))
            }

            CommandKind::DeployAction {
                plugin_id,
                action_id,
                source,
                platforms,
                checksum,
            } => {
                self.extensions.deploy_action(DeploySpec {
                    plugin_id: plugin_id.clone(),
                    artifact_id: action_id.clone(),
                    source_b64: source,
                    platforms,
                    checksum,
                    interval_ms: None,
                })?;
                Ok(serde_json::json!({ "deployed": format!("{plugin_id}/{action_id}") }))
            }

            CommandKind::TriggerAction {
                trigger_id,
                plugin_id,
                action_id,
                arguments,
            } => {
                let immediate = self
                    .extensions
                    .trigger_action(&trigger_id, &plugin_id, &action_id, &arguments)
                    .await?;
                Ok(match immediate {
                    Some(response) => serde_json::json!({
                        "trigger_id": trigger_id,
                        "status": response.status,
                    }),
                    // schedule-shutdown: the response arrives when it fires.
                    None => serde_json::json!({ "trigger_id": trigger_id, "scheduled": true }),
                })
            }

            CommandKind::RemoveMonitor {
                plugin_id,
                monitor_id,
            } => {
                let removed = self.extensions.remove_monitor(&plugin_id, &monitor_id)?;
                Ok(serde_json::json!({ "removed": removed }))
            }

            CommandKind::RemoveAction {
                plugin_id,
                action_id,
            } => {
                let removed = self.extensions.remove_action(&plugin_id, &action_id)?;
                Ok(serde_json::json!({ "removed": removed }))
            }

            CommandKind::UpdateConfig { config } => {
                let applied = self.apply_config_whitelist(&config)?;
                Ok(serde_json::json!({ "applied": applied }))
            }

            CommandKind::UpdateAvailable {
                version,
                url,
                auto_apply,
            } => {
                // The command's own field decides; only an explicit
                // `auto_apply: false` downgrades to a notification.
                if auto_apply != Some(false) {
                    self.updater.launch(&version, url.as_deref());
                    Ok(serde_json::json!({ "version": version, "applying": true }))
                } else {
                    self.updater.notify(&version, url.as_deref());
                    Ok(serde_json::json!({ "version": version, "applying": false }))
                }
            }

            CommandKind::Unknown => {
                tracing::warn!(command_id, "unknown command type");
                Ok(serde_json::json!({ "handled": false }))
            }
        }
    }

    /// Apply only the whitelisted fields of an `UPDATE_CONFIG` payload;
    /// everything else is ignored. Returns the names that were applied.
    fn apply_config_whitelist(
        &self,
        payload: &serde_json::Value,
    ) -> pw_domain::Result<Vec<String>> {
        let mut applied = Vec::new();

        // Validate before mutating so a bad interval rejects the command
        // without touching the document.
        if let Some(ms) = payload.get("check_interval_ms").and_then(|v| v.as_u64()) {
            AgentConfig::validate_check_interval(ms)?;
        }

        self.store.update(|c| {
            if let Some(ms) = payload.get("check_interval_ms").and_then(|v| v.as_u64()) {
                c.check_interval_ms = ms;
                applied.push("check_interval_ms".to_owned());
            }
            if let Some(level) = payload.get("log_level").and_then(|v| v.as_str()) {
                c.log_level = level.to_owned();
                applied.push("log_level".to_owned());
            }
            if let Some(v) = payload.get("enable_discovery").and_then(|v| v.as_bool()) {
                c.enable_discovery = v;
                applied.push("enable_discovery".to_owned());
            }
            if let Some(v) = payload.get("auto_update").and_then(|v| v.as_bool()) {
                c.auto_update = v;
                applied.push("auto_update".to_owned());
            }
        })?;
        Ok(applied)
    }
}
