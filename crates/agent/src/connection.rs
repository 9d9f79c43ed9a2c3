//! The adaptive connection state machine.
//!
//! Mutated only from the sync loop (one writer); everything else reads
//! snapshots. Thresholds and retry cadence come from
//! [`OfflineModeSettings`] and may be replaced by the controller on sync.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use pw_domain::connection::{ConnectionState, ConnectionStatus, OfflineModeSettings};

/// Sleep used while the agent has nothing to connect to.
const UNCONFIGURED_IDLE: Duration = Duration::from_secs(300);

/// One observed state change.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Set when this transition is a recovery to ONLINE after an offline
    /// period; reported to the controller in the next heartbeat.
    pub recovered_after: Option<Duration>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

pub struct ConnectionMachine {
    status: ConnectionStatus,
    settings: OfflineModeSettings,
}

impl ConnectionMachine {
    /// Restart derivation: persisted state is advisory only, so the
    /// machine starts from `is_configured` and lets the first sync outcome
    /// decide the rest.
    pub fn new(configured: bool, settings: OfflineModeSettings) -> Self {
        let mut status = ConnectionStatus::default();
        status.current = if configured {
            ConnectionState::Connecting
        } else {
            ConnectionState::Unconfigured
        };
        Self { status, settings }
    }

    pub fn snapshot(&self) -> ConnectionStatus {
        self.status.clone()
    }

    pub fn settings(&self) -> OfflineModeSettings {
        self.settings.clone()
    }

    /// Replace thresholds/cadence (controller `offline_mode_settings`).
    pub fn apply_settings(&mut self, settings: OfflineModeSettings) {
        if settings != self.settings {
            tracing::info!(?settings, "offline-mode settings updated by controller");
            self.settings = settings;
        }
    }

    /// Configuration appeared or vanished at runtime.
    pub fn set_configured(&mut self, configured: bool) {
        match (configured, self.status.current) {
            (false, _) => {
                self.status = ConnectionStatus::default();
            }
            (true, ConnectionState::Unconfigured) => {
                self.status.current = ConnectionState::Connecting;
            }
            _ => {}
        }
    }

    /// A sync attempt succeeded.
    pub fn record_success(&mut self, now: DateTime<Utc>) -> Transition {
        let from = self.status.current;
        self.status.last_attempt_ts = Some(now);
        if from == ConnectionState::Unconfigured {
            return Transition {
                from,
                to: from,
                recovered_after: None,
            };
        }

        let recovered_after = self
            .status
            .offline_since_ts
            .and_then(|since| (now - since).to_std().ok());
        self.status.last_success_ts = Some(now);
        self.status.consecutive_failures = 0;
        self.status.offline_since_ts = None;
        self.status.current = ConnectionState::Online;

        let transition = Transition {
            from,
            to: ConnectionState::Online,
            recovered_after,
        };
        if transition.changed() {
            tracing::info!(
                from = from.as_str(),
                offline_secs = recovered_after.map(|d| d.as_secs()),
                "controller link recovered"
            );
        }
        transition
    }

    /// A sync attempt failed.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> Transition {
        let from = self.status.current;
        self.status.last_attempt_ts = Some(now);
        if from == ConnectionState::Unconfigured {
            return Transition {
                from,
                to: from,
                recovered_after: None,
            };
        }

        self.status.consecutive_failures += 1;
        let failures = self.status.consecutive_failures;

        let to = match from {
            ConnectionState::Online | ConnectionState::Connecting => {
                if failures >= self.settings.offline_threshold {
                    ConnectionState::Offline
                } else if failures >= self.settings.degraded_threshold {
                    ConnectionState::Degraded
                } else {
                    ConnectionState::Connecting
                }
            }
            ConnectionState::Degraded => {
                if failures >= self.settings.offline_threshold {
                    ConnectionState::Offline
                } else {
                    ConnectionState::Degraded
                }
            }
            ConnectionState::Offline => ConnectionState::Offline,
            ConnectionState::Unconfigured => unreachable!("handled above"),
        };

        if matches!(to, ConnectionState::Degraded | ConnectionState::Offline)
            && self.status.offline_since_ts.is_none()
        {
            self.status.offline_since_ts = Some(now);
        }
        self.status.current = to;

        if from != to {
            tracing::warn!(
                from = from.as_str(),
                to = to.as_str(),
                consecutive_failures = failures,
                "controller link state changed"
            );
        }
        Transition {
            from,
            to,
            recovered_after: None,
        }
    }

    /// How long the sync loop sleeps in the current state.
    pub fn retry_interval(&self, check_interval_ms: u64) -> Duration {
        match self.status.current {
            ConnectionState::Unconfigured => UNCONFIGURED_IDLE,
            ConnectionState::Connecting => Duration::from_secs(self.settings.retry_connecting_secs),
            ConnectionState::Online => Duration::from_millis(check_interval_ms),
            ConnectionState::Degraded => Duration::from_secs(self.settings.retry_degraded_secs),
            ConnectionState::Offline => Duration::from_secs(self.settings.retry_offline_secs),
        }
    }

    /// Seconds spent offline so far, if degraded or offline.
    pub fn offline_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.status
            .offline_since_ts
            .and_then(|since| (now - since).to_std().ok())
    }
}

/// Shared handle: the sync loop writes, observers snapshot.
#[derive(Clone)]
pub struct ConnectionHandle(Arc<RwLock<ConnectionMachine>>);

impl ConnectionHandle {
    pub fn new(machine: ConnectionMachine) -> Self {
        Self(Arc::new(RwLock::new(machine)))
    }

    pub fn snapshot(&self) -> ConnectionStatus {
        self.0.read().snapshot()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut ConnectionMachine) -> R) -> R {
        f(&mut self.0.write())
    }
}
