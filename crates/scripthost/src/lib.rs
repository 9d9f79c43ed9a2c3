//! Sandboxed evaluation of controller-supplied scripts.
//!
//! The outer contract is the stable part: a script plus an `args` object
//! goes in, a JSON value comes out, bounded by a wall-clock timeout and a
//! memory ceiling. The concrete backend is a side-process runner: each
//! evaluation spawns one short-lived child (default: `node` with the
//! bundled harness), hands it the script over stdin as a single JSON line,
//! and serves its capability requests (log, file probes, constrained exec)
//! line-by-line until it reports a result. All enforcement — path
//! allowlist, command denylist, output caps, timeouts, the memory ceiling —
//! happens on the Rust side of the pipe.

mod caps;
mod error;
mod evaluator;
mod subprocess;

pub use caps::{CapabilityBroker, CapabilityConfig, ExecOutcome};
pub use error::{classify_error, ErrorCategory, ScriptError};
pub use evaluator::{EvalContext, EvalLimits, ScriptEvaluator};
pub use subprocess::{ensure_harness, RunnerConfig, SubprocessEvaluator};
