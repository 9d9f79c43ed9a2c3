//! Side-process script runner.
//!
//! One child process per evaluation: the request goes down stdin as a
//! single JSON line, capability calls come back as JSON lines and are
//! answered in place, and the final `result`/`error` line ends the run.
//! The child is killed on wall-clock timeout or when its resident memory
//! crosses the ceiling.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::caps::CapabilityBroker;
use crate::error::ScriptError;
use crate::evaluator::{EvalContext, EvalLimits, ScriptEvaluator};

/// Bundled harness source, materialized on disk at startup.
const HARNESS_JS: &str = include_str!("harness.js");

/// How often the child's resident memory is sampled.
const MEMORY_POLL: Duration = Duration::from_millis(250);

/// Non-JSON stdout lines tolerated before the run is declared broken.
const MAX_SKIP_LINES: usize = 100;

/// How the runner child is launched.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Interpreter binary, e.g. `node`.
    pub command: String,
    /// Arguments, typically just the harness path.
    pub args: Vec<String>,
    pub limits: EvalLimits,
}

impl RunnerConfig {
    pub fn node(harness_path: &Path) -> Self {
        Self {
            command: "node".into(),
            args: vec![harness_path.display().to_string()],
            limits: EvalLimits::default(),
        }
    }
}

/// Write the bundled harness under `dir` and return its path.
pub fn ensure_harness(dir: &Path) -> pw_domain::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("harness.js");
    let current = std::fs::read_to_string(&path).unwrap_or_default();
    if current != HARNESS_JS {
        std::fs::write(&path, HARNESS_JS)?;
    }
    Ok(path)
}

/// One line from the child.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ChildMessage {
    Log {
        level: String,
        message: String,
    },
    FileExists {
        id: u64,
        path: String,
    },
    ReadFile {
        id: u64,
        path: String,
    },
    Exec {
        id: u64,
        command: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Result {
        #[serde(default)]
        value: Value,
    },
    Error {
        message: String,
    },
}

pub struct SubprocessEvaluator {
    config: RunnerConfig,
    broker: CapabilityBroker,
}

impl SubprocessEvaluator {
    pub fn new(config: RunnerConfig, broker: CapabilityBroker) -> Self {
        Self { config, broker }
    }

    /// Answer one capability request, returning the reply line to write.
    async fn serve(&self, msg: ChildMessage, ctx: &EvalContext) -> Option<String> {
        let reply = |id: u64, outcome: Result<Value, String>| {
            let body = match outcome {
                Ok(value) => serde_json::json!({ "id": id, "ok": true, "value": value }),
                Err(error) => serde_json::json!({ "id": id, "ok": false, "error": error }),
            };
            Some(body.to_string())
        };

        match msg {
            ChildMessage::Log { level, message } => {
                match level.as_str() {
                    "debug" => tracing::debug!(
                        plugin_id = %ctx.plugin_id, artifact_id = %ctx.artifact_id,
                        "script: {message}"
                    ),
                    "warn" => tracing::warn!(
                        plugin_id = %ctx.plugin_id, artifact_id = %ctx.artifact_id,
                        "script: {message}"
                    ),
                    _ => tracing::info!(
                        plugin_id = %ctx.plugin_id, artifact_id = %ctx.artifact_id,
                        "script: {message}"
                    ),
                }
                None
            }
            ChildMessage::FileExists { id, path } => {
                reply(id, self.broker.file_exists(&path).map(Value::Bool))
            }
            ChildMessage::ReadFile { id, path } => {
                reply(id, self.broker.read_file(&path).map(Value::String))
            }
            ChildMessage::Exec {
                id,
                command,
                timeout_ms,
            } => reply(
                id,
                self.broker
                    .exec(&command, timeout_ms)
                    .await
                    .map(|o| serde_json::to_value(o).unwrap_or(Value::Null)),
            ),
            // Terminal messages are handled by the caller.
            other @ (ChildMessage::Result { .. } | ChildMessage::Error { .. }) => {
                debug_assert!(false, "terminal message reached serve: {other:?}");
                None
            }
        }
    }

    /// Current resident memory of `pid`, if it is still running.
    fn child_rss(sys: &mut System, pid: u32) -> Option<u64> {
        let target = Pid::from_u32(pid);
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        sys.process(target).map(|p| p.memory())
    }
}

#[async_trait]
impl ScriptEvaluator for SubprocessEvaluator {
    async fn evaluate(
        &self,
        source: &str,
        args: &Value,
        ctx: &EvalContext,
    ) -> Result<Value, ScriptError> {
        let limits = self.config.limits;
        let mut child = tokio::process::Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScriptError::Spawn(format!("{}: {e}", self.config.command)))?;

        let pid = child.id().unwrap_or_default();
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ScriptError::Spawn("failed to capture runner stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScriptError::Spawn("failed to capture runner stdout".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let request = serde_json::json!({
            "source": source,
            "args": args,
            "context": ctx,
        });
        let mut line = request.to_string();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ScriptError::Spawn(format!("writing request: {e}")))?;

        let deadline = tokio::time::Instant::now() + Duration::from_millis(limits.timeout_ms);
        let mut mem_timer = tokio::time::interval(MEMORY_POLL);
        mem_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sys = System::new();
        let mut skipped = 0usize;

        let outcome = loop {
            tokio::select! {
                next = lines.next_line() => {
                    let text = match next {
                        Ok(Some(t)) => t,
                        Ok(None) => break Err(ScriptError::Protocol(
                            "runner exited without a result".into(),
                        )),
                        Err(e) => break Err(ScriptError::Protocol(format!("reading runner: {e}"))),
                    };
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let msg = match serde_json::from_str::<ChildMessage>(trimmed) {
                        Ok(m) => m,
                        Err(_) => {
                            skipped += 1;
                            if skipped >= MAX_SKIP_LINES {
                                break Err(ScriptError::Protocol(
                                    "runner produced too many non-protocol lines".into(),
                                ));
                            }
                            tracing::debug!(line = %trimmed, "skipping non-protocol runner output");
                            continue;
                        }
                    };
                    match msg {
                        ChildMessage::Result { value } => break Ok(value),
                        ChildMessage::Error { message } => {
                            break Err(ScriptError::Runtime(message))
                        }
                        other => {
                            if let Some(reply) = self.serve(other, ctx).await {
                                let mut out = reply;
                                out.push('\n');
                                if stdin.write_all(out.as_bytes()).await.is_err() {
                                    break Err(ScriptError::Protocol(
                                        "runner closed stdin mid-call".into(),
                                    ));
                                }
                            }
                        }
                    }
                }
                _ = mem_timer.tick() => {
                    if pid != 0 {
                        if let Some(rss) = Self::child_rss(&mut sys, pid) {
                            if rss > limits.memory_bytes {
                                break Err(ScriptError::Memory {
                                    limit_bytes: limits.memory_bytes,
                                    observed_bytes: rss,
                                });
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break Err(ScriptError::Timeout { limit_ms: limits.timeout_ms });
                }
            }
        };

        // One runner per evaluation: always reap the child.
        let _ = child.kill().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::CapabilityConfig;

    fn ctx() -> EvalContext {
        EvalContext {
            plugin_id: "pl".into(),
            artifact_id: "m1".into(),
            platform: "linux".into(),
            arch: "x86_64".into(),
            hostname: "test-host".into(),
            username: "tester".into(),
        }
    }

    /// Fake runner: a shell one-liner standing in for the node harness so
    /// the host side is testable without an interpreter installed.
    #[cfg(unix)]
    fn sh_runner(script: &str, limits: EvalLimits) -> SubprocessEvaluator {
        SubprocessEvaluator::new(
            RunnerConfig {
                command: "sh".into(),
                args: vec!["-c".into(), script.into()],
                limits,
            },
            CapabilityBroker::new(&CapabilityConfig::default()),
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn result_line_resolves_evaluation() {
        let eval = sh_runner(
            r#"read req; printf '{"op":"result","value":{"answer":42}}\n'"#,
            EvalLimits::default(),
        );
        let value = eval
            .evaluate("ignored", &serde_json::json!({}), &ctx())
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!({"answer": 42}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn error_line_becomes_runtime_error() {
        let eval = sh_runner(
            r#"read req; printf '{"op":"error","message":"boom"}\n'"#,
            EvalLimits::default(),
        );
        match eval.evaluate("x", &serde_json::json!({}), &ctx()).await {
            Err(ScriptError::Runtime(m)) => assert_eq!(m, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn wall_clock_timeout_kills_runner() {
        let eval = sh_runner(
            "read req; sleep 30",
            EvalLimits {
                timeout_ms: 200,
                ..EvalLimits::default()
            },
        );
        match eval.evaluate("x", &serde_json::json!({}), &ctx()).await {
            Err(ScriptError::Timeout { limit_ms }) => assert_eq!(limit_ms, 200),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn capability_round_trip_through_fake_runner() {
        // The fake runner asks for a file probe of /tmp and reports whether
        // the host's reply said ok.
        let script = r#"read req
printf '{"op":"file_exists","id":1,"path":"/tmp"}\n'
read reply
case "$reply" in
  *'"ok":true'*) printf '{"op":"result","value":"allowed"}\n' ;;
  *) printf '{"op":"result","value":"denied"}\n' ;;
esac"#;
        let eval = sh_runner(script, EvalLimits::default());
        let value = eval
            .evaluate("x", &serde_json::json!({}), &ctx())
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!("allowed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_is_protocol_error() {
        let eval = sh_runner("exit 0", EvalLimits::default());
        match eval.evaluate("x", &serde_json::json!({}), &ctx()).await {
            Err(ScriptError::Protocol(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn harness_is_materialized_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = ensure_harness(tmp.path()).unwrap();
        assert!(path.exists());
        let first = std::fs::read_to_string(&path).unwrap();
        ensure_harness(tmp.path()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
        assert!(first.contains("file_exists"));
    }

    #[tokio::test]
    async fn missing_runner_is_spawn_error() {
        let eval = SubprocessEvaluator::new(
            RunnerConfig {
                command: "definitely-not-a-real-binary".into(),
                args: vec![],
                limits: EvalLimits::default(),
            },
            CapabilityBroker::new(&CapabilityConfig::default()),
        );
        match eval.evaluate("x", &serde_json::json!({}), &ctx()).await {
            Err(ScriptError::Spawn(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
