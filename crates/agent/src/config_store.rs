//! Atomic load/save of the configuration document.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use pw_domain::config::AgentConfig;
use pw_domain::{Error, Result};
use pw_queue::fsio;

/// Single-writer store for [`AgentConfig`]. Reads are lock-free clones of
/// the in-memory snapshot; every mutation goes through [`update`] and is
/// persisted atomically before the call returns.
pub struct ConfigStore {
    path: PathBuf,
    config: RwLock<AgentConfig>,
}

impl ConfigStore {
    /// Load `config.json`, or start from defaults when it does not exist.
    /// A document that exists but does not parse is fatal: enforcing from
    /// a half-read config is worse than refusing to start.
    pub fn load(path: &Path) -> Result<Arc<Self>> {
        let config = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<AgentConfig>(&raw)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AgentConfig::default(),
            Err(e) => return Err(Error::Config(format!("{}: {e}", path.display()))),
        };
        tracing::debug!(path = %path.display(), configured = config.is_configured(), "config loaded");
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            config: RwLock::new(config),
        }))
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> AgentConfig {
        self.config.read().clone()
    }

    /// Mutate and persist. Returns the new snapshot.
    pub fn update<F: FnOnce(&mut AgentConfig)>(&self, mutate: F) -> Result<AgentConfig> {
        let mut config = self.config.write();
        mutate(&mut config);
        self.persist(&config)?;
        Ok(config.clone())
    }

    fn persist(&self, config: &AgentConfig) -> Result<()> {
        fsio::atomic_write_json(&self.path, config)?;
        restrict_permissions(&self.path)?;
        Ok(())
    }
}

/// Owner-only file mode; the document carries the bearer token.
#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_starts_from_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(&tmp.path().join("config.json")).unwrap();
        assert!(!store.snapshot().is_configured());
    }

    #[test]
    fn update_persists_and_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let store = ConfigStore::load(&path).unwrap();
        store
            .update(|c| {
                c.agent_id = Some("a1".into());
                c.auth_token = Some("t1".into());
            })
            .unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        let snap = reloaded.snapshot();
        assert_eq!(snap.agent_id.as_deref(), Some("a1"));
        assert_eq!(snap.auth_token.as_deref(), Some("t1"));
    }

    #[test]
    fn corrupt_document_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        match ConfigStore::load(&path) {
            Err(Error::Config(_)) => {}
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[cfg(unix)]
    #[test]
    fn config_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let store = ConfigStore::load(&path).unwrap();
        store.update(|_| {}).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
