//! The capability surface scripts may call, enforced host-side.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncReadExt;

/// Commands a script may never run, matched as case-insensitive substrings.
const EXEC_DENYLIST: &[&str] = &["rm -rf", "del /s", "format", "mkfs", "dd if="];

/// Hard ceiling on a capability exec's runtime.
pub const EXEC_MAX_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on exec output and file reads.
pub const OUTPUT_CAP_BYTES: usize = 1024 * 1024;

/// Configuration of the script capability surface.
#[derive(Debug, Clone)]
pub struct CapabilityConfig {
    /// Directories scripts may probe and read (never write).
    pub readable_roots: Vec<PathBuf>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        let mut roots = vec![PathBuf::from("/tmp"), PathBuf::from("/var/log")];
        if let Some(home) = dirs::home_dir() {
            roots.push(home);
        }
        roots.push(std::env::temp_dir());
        Self {
            readable_roots: roots,
        }
    }
}

/// Outcome of a capability exec.
#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub output: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

/// Serves capability requests from the script runner. All policy lives
/// here, on the host side of the pipe; the harness only relays calls.
pub struct CapabilityBroker {
    roots: Vec<PathBuf>,
}

impl CapabilityBroker {
    pub fn new(config: &CapabilityConfig) -> Self {
        // Canonicalize the roots once so later prefix checks can't be
        // defeated through symlinked paths.
        let roots = config
            .readable_roots
            .iter()
            .filter_map(|r| r.canonicalize().ok())
            .collect();
        Self { roots }
    }

    /// Whether `path` resolves inside one of the allowlisted roots.
    fn path_allowed(&self, path: &Path) -> bool {
        let resolved = match path.canonicalize() {
            Ok(p) => p,
            // A nonexistent leaf is judged by its parent directory.
            Err(_) => match path.parent().and_then(|p| p.canonicalize().ok()) {
                Some(parent) => parent.join(path.file_name().unwrap_or_default()),
                None => return false,
            },
        };
        self.roots.iter().any(|root| resolved.starts_with(root))
    }

    /// Read-only existence probe.
    pub fn file_exists(&self, path: &str) -> Result<bool, String> {
        let path = Path::new(path);
        if !self.path_allowed(path) {
            return Err(format!(
                "access blocked: {} is outside the readable roots",
                path.display()
            ));
        }
        Ok(path.exists())
    }

    /// Read a file inside the allowlist, capped at [`OUTPUT_CAP_BYTES`].
    pub fn read_file(&self, path: &str) -> Result<String, String> {
        let path = Path::new(path);
        if !self.path_allowed(path) {
            return Err(format!(
                "access blocked: {} is outside the readable roots",
                path.display()
            ));
        }
        let bytes = std::fs::read(path).map_err(|e| format!("read {}: {e}", path.display()))?;
        let bytes = if bytes.len() > OUTPUT_CAP_BYTES {
            &bytes[..OUTPUT_CAP_BYTES]
        } else {
            &bytes[..]
        };
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Run a shell command on behalf of the script.
    ///
    /// Refuses denylisted commands, merges stdout+stderr, caps the output
    /// at 1 MB, and times out at `min(timeout_ms, 30s)`.
    pub async fn exec(&self, command: &str, timeout_ms: Option<u64>) -> Result<ExecOutcome, String> {
        let lower = command.to_ascii_lowercase();
        if let Some(denied) = EXEC_DENYLIST.iter().find(|d| lower.contains(*d)) {
            return Err(format!("command blocked by policy (contains '{denied}')"));
        }

        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(EXEC_MAX_TIMEOUT)
            .min(EXEC_MAX_TIMEOUT);

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = tokio::process::Command::new("cmd");
            c.arg("/C").arg(command);
            c
        } else {
            let mut c = tokio::process::Command::new("sh");
            c.arg("-c").arg(command);
            c
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| format!("spawn: {e}"))?;
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let run = async {
            let mut out = Vec::new();
            let mut err_buf = Vec::new();
            let (status, _, _) = tokio::join!(
                child.wait(),
                async {
                    if let Some(s) = stdout.as_mut() {
                        let _ = s.read_to_end(&mut out).await;
                    }
                },
                async {
                    if let Some(s) = stderr.as_mut() {
                        let _ = s.read_to_end(&mut err_buf).await;
                    }
                }
            );
            out.extend_from_slice(&err_buf);
            status.map(|st| (st, out))
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok((status, mut output))) => {
                let truncated = output.len() > OUTPUT_CAP_BYTES;
                if truncated {
                    output.truncate(OUTPUT_CAP_BYTES);
                }
                Ok(ExecOutcome {
                    exit_code: status.code().unwrap_or(-1),
                    output: String::from_utf8_lossy(&output).into_owned(),
                    truncated,
                })
            }
            Ok(Err(e)) => Err(format!("wait: {e}")),
            Err(_) => {
                let _ = child.kill().await;
                Err(format!("command timed out after {}ms", timeout.as_millis()))
            }
        }
    }
}
