//! Controller-scheduled shutdowns.
//!
//! Warning and termination instants are armed as local timers the moment
//! the command arrives, so they fire even if the controller link drops
//! afterwards. The resulting action response waits in the durable queue
//! until the next successful upload.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::manager::ExtensionManager;

/// Parsed `schedule-shutdown` arguments.
#[derive(Debug, Clone)]
pub struct ShutdownSpec {
    pub shutdown_ts: DateTime<Utc>,
    pub process_name: String,
    /// Minutes before `shutdown_ts` at which warnings fire.
    pub warning_intervals_min: Vec<u64>,
    pub reason: String,
}

impl ShutdownSpec {
    /// Parse trigger arguments. `shutdown_ts` may be epoch milliseconds or
    /// an RFC 3339 string.
    pub fn from_args(args: &serde_json::Value) -> Result<Self, String> {
        let shutdown_ts = match args.get("shutdown_ts") {
            Some(serde_json::Value::Number(n)) => {
                let ms = n.as_i64().ok_or("shutdown_ts out of range")?;
                Utc.timestamp_millis_opt(ms)
                    .single()
                    .ok_or("shutdown_ts out of range")?
            }
            Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map_err(|e| format!("shutdown_ts: {e}"))?
                .with_timezone(&Utc),
            _ => return Err("missing shutdown_ts".into()),
        };
        let process_name = args
            .get("process_name")
            .and_then(|v| v.as_str())
            .ok_or("missing process_name")?
            .to_owned();
        let warning_intervals_min = args
            .get("warning_intervals_min")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_u64()).collect())
            .unwrap_or_default();
        let reason = args
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("scheduled by controller")
            .to_owned();
        Ok(Self {
            shutdown_ts,
            process_name,
            warning_intervals_min,
            reason,
        })
    }
}

/// Status-surface snapshot of the pending shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownView {
    pub shutdown_ts: DateTime<Utc>,
    pub process_name: String,
    pub reason: String,
    pub warnings_total: usize,
    pub warnings_fired: usize,
}

/// Owned timer set for at most one scheduled shutdown.
#[derive(Default)]
pub(crate) struct ShutdownSchedule {
    handles: Vec<JoinHandle<()>>,
    armed: Option<ArmedShutdown>,
}

struct ArmedShutdown {
    spec: ShutdownSpec,
    warnings_fired: Arc<AtomicUsize>,
}

impl ShutdownSchedule {
    /// Spawn warning timers at `shutdown_ts - Δ` and the termination timer
    /// at `shutdown_ts`. Instants already in the past fire immediately.
    pub(crate) fn arm(
        &mut self,
        manager: &Arc<ExtensionManager>,
        trigger_id: &str,
        plugin_id: &str,
        spec: ShutdownSpec,
    ) {
        let now = Utc::now();
        let warnings_fired = Arc::new(AtomicUsize::new(0));

        for minutes in &spec.warning_intervals_min {
            let warn_at = spec.shutdown_ts - chrono::Duration::minutes(*minutes as i64);
            let delay = delay_until(&now, &warn_at);
            let process_name = spec.process_name.clone();
            let reason = spec.reason.clone();
            let minutes = *minutes;
            let fired = Arc::clone(&warnings_fired);
            self.handles.push(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                fired.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    process_name = %process_name,
                    minutes_remaining = minutes,
                    reason = %reason,
                    "scheduled shutdown warning"
                );
            }));
        }

        let delay = delay_until(&now, &spec.shutdown_ts);
        let manager = Arc::clone(manager);
        let trigger_id = trigger_id.to_owned();
        let plugin_id = plugin_id.to_owned();
        let task_spec = spec.clone();
        self.handles.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.execute_shutdown(&trigger_id, &plugin_id, &task_spec);
        }));

        tracing::info!(
            process_name = %spec.process_name,
            shutdown_ts = %spec.shutdown_ts,
            warnings = spec.warning_intervals_min.len(),
            "shutdown scheduled"
        );
        self.armed = Some(ArmedShutdown {
            spec,
            warnings_fired,
        });
    }

    /// Abort every pending timer. Returns whether a schedule was armed.
    pub(crate) fn cancel(&mut self) -> bool {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        let was_armed = self.armed.take().is_some();
        if was_armed {
            tracing::info!("scheduled shutdown cancelled");
        }
        was_armed
    }

    /// Called by the termination timer once it has run: drop the schedule
    /// without aborting (the remaining handles have already completed).
    pub(crate) fn clear_after_fire(&mut self) {
        self.handles.clear();
        self.armed = None;
    }

    pub(crate) fn view(&self) -> Option<ShutdownView> {
        self.armed.as_ref().map(|a| ShutdownView {
            shutdown_ts: a.spec.shutdown_ts,
            process_name: a.spec.process_name.clone(),
            reason: a.spec.reason.clone(),
            warnings_total: a.spec.warning_intervals_min.len(),
            warnings_fired: a.warnings_fired.load(Ordering::Relaxed),
        })
    }
}

/// Non-negative sleep duration from `now` to `at`.
fn delay_until(now: &DateTime<Utc>, at: &DateTime<Utc>) -> Duration {
    (*at - *now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_epoch_millis_args() {
        let args = serde_json::json!({
            "shutdown_ts": 1_700_000_900_000i64,
            "process_name": "Steam.exe",
            "warning_intervals_min": [10, 5, 2, 1],
            "reason": "quota exhausted"
        });
        let spec = ShutdownSpec::from_args(&args).unwrap();
        assert_eq!(spec.process_name, "Steam.exe");
        assert_eq!(spec.warning_intervals_min, vec![10, 5, 2, 1]);
        assert_eq!(spec.shutdown_ts.timestamp_millis(), 1_700_000_900_000);
    }

    #[test]
    fn parses_rfc3339_and_defaults() {
        let args = serde_json::json!({
            "shutdown_ts": "2026-01-02T03:04:05Z",
            "process_name": "chrome"
        });
        let spec = ShutdownSpec::from_args(&args).unwrap();
        assert!(spec.warning_intervals_min.is_empty());
        assert_eq!(spec.reason, "scheduled by controller");
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!(ShutdownSpec::from_args(&serde_json::json!({})).is_err());
        assert!(ShutdownSpec::from_args(&serde_json::json!({
            "shutdown_ts": 1_700_000_000_000i64
        }))
        .is_err());
    }

    #[test]
    fn past_instants_have_zero_delay() {
        let now = Utc::now();
        let past = now - chrono::Duration::seconds(30);
        assert_eq!(delay_until(&now, &past), Duration::ZERO);
    }
}
