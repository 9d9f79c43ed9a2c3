//! Crash-safe JSON file IO shared by the queues and the config store.

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use pw_domain::Result;

/// Atomically replace `path` with the JSON serialization of `value`:
/// write to a sibling temp file, fsync, then rename over the target.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        let json = serde_json::to_vec_pretty(value)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load JSON from `path`. A missing file yields `default`. A file that no
/// longer parses is quarantined to `<path>.corrupt` (the recoverable half
/// of a partial write is the rename itself, so this only happens on
/// external tampering or disk faults) and `default` is returned.
pub fn load_json_or_default<T: DeserializeOwned>(path: &Path, default: T) -> T {
    let raw = match std::fs::read_to_string(path) {
        Ok(r) => r,
        Err(_) => return default,
    };
    match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            let quarantine = path.with_extension("json.corrupt");
            tracing::error!(
                path = %path.display(),
                error = %e,
                quarantine = %quarantine.display(),
                "state file unreadable, quarantining"
            );
            if let Err(e) = std::fs::rename(path, &quarantine) {
                tracing::warn!(error = %e, "failed to quarantine corrupt state file");
            }
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        atomic_write_json(&path, &vec![1, 2, 3]).unwrap();
        let back: Vec<i32> = load_json_or_default(&path, vec![]);
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn missing_file_yields_default() {
        let tmp = tempfile::tempdir().unwrap();
        let back: Vec<i32> = load_json_or_default(&tmp.path().join("nope.json"), vec![9]);
        assert_eq!(back, vec![9]);
    }

    #[test]
    fn corrupt_file_is_quarantined() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "{truncated").unwrap();
        let back: Vec<i32> = load_json_or_default(&path, vec![]);
        assert!(back.is_empty());
        assert!(!path.exists());
        assert!(path.with_extension("json.corrupt").exists());
    }

    #[test]
    fn no_temp_file_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        atomic_write_json(&path, &42u32).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
    }
}
