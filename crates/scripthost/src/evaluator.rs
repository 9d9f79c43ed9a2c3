//! The evaluator seam.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ScriptError;

/// Identity handed to every evaluation so scripts can see where they run
/// and logs can be attributed.
#[derive(Debug, Clone, Serialize)]
pub struct EvalContext {
    pub plugin_id: String,
    pub artifact_id: String,
    pub platform: String,
    pub arch: String,
    pub hostname: String,
    pub username: String,
}

/// Resource caps for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvalLimits {
    pub timeout_ms: u64,
    pub memory_bytes: u64,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            memory_bytes: 128 * 1024 * 1024,
        }
    }
}

/// Evaluate controller-supplied script text.
///
/// Implementations run each invocation in an isolated scope: nothing
/// mutable is shared between calls.
#[async_trait]
pub trait ScriptEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        source: &str,
        args: &serde_json::Value,
        ctx: &EvalContext,
    ) -> Result<serde_json::Value, ScriptError>;
}
