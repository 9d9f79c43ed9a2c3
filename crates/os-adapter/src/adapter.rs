//! Process enumeration and termination behind a trait.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

use pw_domain::{Error, Result};

/// A row from the live process table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exe: Option<String>,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
}

/// Enumerate and terminate processes. Implementations are platform-specific;
/// tests substitute a scripted fake.
pub trait ProcessAdapter: Send + Sync {
    /// Snapshot of the current process table.
    fn processes(&self) -> Result<Vec<ProcessInfo>>;

    /// Processes whose name matches `name` (see [`names_match`]).
    fn find_by_name(&self, name: &str) -> Result<Vec<ProcessInfo>> {
        Ok(self
            .processes()?
            .into_iter()
            .filter(|p| names_match(&p.name, name))
            .collect())
    }

    /// Terminate a single process. Returns `false` if the pid is gone.
    fn terminate_pid(&self, pid: u32) -> Result<bool>;

    /// Terminate every process matching `name`; returns the terminated rows.
    fn terminate_by_name(&self, name: &str) -> Result<Vec<ProcessInfo>> {
        let matches = self.find_by_name(name)?;
        let mut terminated = Vec::new();
        for p in matches {
            if self.terminate_pid(p.pid)? {
                terminated.push(p);
            }
        }
        Ok(terminated)
    }
}

/// Case-insensitive process-name comparison, tolerant of a missing or
/// present `.exe` suffix on either side.
pub fn names_match(candidate: &str, target: &str) -> bool {
    let c = candidate.to_ascii_lowercase();
    let t = target.to_ascii_lowercase();
    if c == t {
        return true;
    }
    let strip = |s: &str| s.strip_suffix(".exe").map(str::to_owned);
    match (strip(&c), strip(&t)) {
        (Some(c2), None) => c2 == t,
        (None, Some(t2)) => c == t2,
        _ => false,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// sysinfo implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// [`ProcessAdapter`] backed by the `sysinfo` crate.
pub struct SysinfoAdapter {
    system: Mutex<System>,
}

impl SysinfoAdapter {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessAdapter for SysinfoAdapter {
    fn processes(&self) -> Result<Vec<ProcessInfo>> {
        let mut sys = self.system.lock();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        Ok(sys
            .processes()
            .iter()
            .map(|(pid, p)| ProcessInfo {
                pid: pid.as_u32(),
                name: p.name().to_string_lossy().into_owned(),
                exe: p.exe().map(|e| e.display().to_string()),
                memory_bytes: p.memory(),
            })
            .collect())
    }

    fn terminate_pid(&self, pid: u32) -> Result<bool> {
        let mut sys = self.system.lock();
        let target = Pid::from_u32(pid);
        if sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true) == 0 {
            return Ok(false);
        }
        match sys.process(target) {
            Some(p) => {
                if p.kill() {
                    tracing::debug!(pid, "terminated process");
                    Ok(true)
                } else {
                    Err(Error::OsAdapter(format!(
                        "failed to signal pid {pid} (insufficient privileges?)"
                    )))
                }
            }
            None => Ok(false),
        }
    }
}
