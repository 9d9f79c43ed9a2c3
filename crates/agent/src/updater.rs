//! Auto-update collaborator.
//!
//! The actual installer is an external program; the agent only learns that
//! an update exists (via `UPDATE_AVAILABLE` or a periodic check) and either
//! records it or steps aside. Stepping aside means exiting with code 0 so
//! the installer can replace the binary and restart the service.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// A pending update as shown on the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateInfo {
    pub version: String,
    pub url: Option<String>,
    pub announced_ts: DateTime<Utc>,
}

/// Seam to the external installer.
#[async_trait]
pub trait UpdateLauncher: Send + Sync {
    /// Record that an update exists without applying it.
    fn notify(&self, version: &str, url: Option<&str>);

    /// Hand over to the installer (for the default launcher: request a
    /// clean exit so the external installer can take over).
    fn launch(&self, version: &str, url: Option<&str>);

    /// The most recently announced update, if any.
    fn available(&self) -> Option<UpdateInfo>;

    /// Ask the collaborator whether an update exists. Release lookup is
    /// controller-driven, so the default has nothing to ask.
    async fn check(&self) -> Option<UpdateInfo> {
        None
    }
}

/// Default launcher: records availability and, on `launch`, cancels the
/// supervisor's shutdown token (mapped to exit code 0).
pub struct LogOnlyLauncher {
    available: RwLock<Option<UpdateInfo>>,
    takeover: CancellationToken,
    requested: AtomicBool,
}

impl LogOnlyLauncher {
    pub fn new(takeover: CancellationToken) -> Self {
        Self {
            available: RwLock::new(None),
            takeover,
            requested: AtomicBool::new(false),
        }
    }

    pub fn takeover_requested(&self) -> bool {
        self.requested.load(Ordering::Relaxed)
    }

    fn record(&self, version: &str, url: Option<&str>) {
        *self.available.write() = Some(UpdateInfo {
            version: version.to_owned(),
            url: url.map(str::to_owned),
            announced_ts: Utc::now(),
        });
    }
}

#[async_trait]
impl UpdateLauncher for LogOnlyLauncher {
    fn notify(&self, version: &str, url: Option<&str>) {
        tracing::info!(version, url, "update available");
        self.record(version, url);
    }

    fn launch(&self, version: &str, url: Option<&str>) {
        tracing::info!(version, url, "update available, exiting for installer takeover");
        self.record(version, url);
        self.requested.store(true, Ordering::Relaxed);
        self.takeover.cancel();
    }

    fn available(&self) -> Option<UpdateInfo> {
        self.available.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_records_without_takeover() {
        let launcher = LogOnlyLauncher::new(CancellationToken::new());
        launcher.notify("1.2.3", Some("https://example/dl"));
        assert_eq!(launcher.available().unwrap().version, "1.2.3");
        assert!(!launcher.takeover_requested());
    }

    #[test]
    fn launch_cancels_the_takeover_token() {
        let token = CancellationToken::new();
        let launcher = LogOnlyLauncher::new(token.clone());
        launcher.launch("1.2.3", None);
        assert!(launcher.takeover_requested());
        assert!(token.is_cancelled());
    }
}
