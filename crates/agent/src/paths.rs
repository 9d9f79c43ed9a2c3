//! Persisted-state layout under the platform config root.
//!
//! ```text
//! <root>/
//!   config.json                    owner-only agent configuration
//!   logs/                          rotated JSON logs
//!   plugins/
//!     monitors.json                deployed monitor artifacts
//!     actions.json                 deployed action artifacts
//!     harness.js                   script runner harness
//!   data-queue/pending.json        telemetry awaiting upload
//!   action-responses/pending.json  action responses awaiting upload
//! ```

use std::path::{Path, PathBuf};

/// Environment override for the state root, used by tests and packaging.
pub const ROOT_ENV: &str = "PW_CONFIG_DIR";

#[derive(Debug, Clone)]
pub struct AgentPaths {
    root: PathBuf,
}

impl AgentPaths {
    /// Resolve the state root: `$PW_CONFIG_DIR`, else the platform config
    /// directory (`~/.config/procwarden` on Linux), else a dotdir in the
    /// working directory.
    pub fn resolve() -> Self {
        let root = std::env::var_os(ROOT_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::config_dir().map(|d| d.join("procwarden")))
            .unwrap_or_else(|| PathBuf::from(".procwarden"));
        Self { root }
    }

    pub fn at(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    /// The queues nest their own subdirectories under the root.
    pub fn state_dir(&self) -> &Path {
        &self.root
    }
}
