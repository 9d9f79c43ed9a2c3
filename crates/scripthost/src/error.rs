//! Script failure types and the compact error-category classifier.

use serde::Serialize;

/// Why a script evaluation failed. None of these crash the agent; they are
/// recorded as telemetry entries or action responses.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script exceeded {limit_ms}ms wall-clock limit")]
    Timeout { limit_ms: u64 },

    #[error("script exceeded {limit_bytes} byte memory ceiling (observed {observed_bytes})")]
    Memory {
        limit_bytes: u64,
        observed_bytes: u64,
    },

    /// The script itself threw or returned an error.
    #[error("script error: {0}")]
    Runtime(String),

    /// The runner process could not be started.
    #[error("failed to start script runner: {0}")]
    Spawn(String),

    /// The runner spoke garbage or exited without a result.
    #[error("script runner protocol violation: {0}")]
    Protocol(String),
}

impl ScriptError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ScriptError::Timeout { .. } => ErrorCategory::Timeout,
            ScriptError::Memory { .. } => ErrorCategory::Unknown,
            ScriptError::Runtime(msg) => classify_error(msg),
            ScriptError::Spawn(msg) | ScriptError::Protocol(msg) => classify_error(msg),
        }
    }
}

/// Compact category attached to telemetry and action responses so the
/// controller can bucket failures without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    PermissionDenied,
    ResourceNotFound,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::PermissionDenied => "permission_denied",
            ErrorCategory::ResourceNotFound => "resource_not_found",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// Keyword classifier over an error message.
pub fn classify_error(message: &str) -> ErrorCategory {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        ErrorCategory::Timeout
    } else if lower.contains("permission denied")
        || lower.contains("access denied")
        || lower.contains("eacces")
        || lower.contains("eperm")
        || lower.contains("not allowed")
        || lower.contains("blocked")
    {
        ErrorCategory::PermissionDenied
    } else if lower.contains("not found")
        || lower.contains("no such file")
        || lower.contains("enoent")
        || lower.contains("does not exist")
    {
        ErrorCategory::ResourceNotFound
    } else {
        ErrorCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_keyword() {
        assert_eq!(classify_error("operation timed out"), ErrorCategory::Timeout);
        assert_eq!(
            classify_error("EACCES: permission denied, open '/etc/shadow'"),
            ErrorCategory::PermissionDenied
        );
        assert_eq!(
            classify_error("ENOENT: no such file or directory"),
            ErrorCategory::ResourceNotFound
        );
        assert_eq!(classify_error("kaboom"), ErrorCategory::Unknown);
    }

    #[test]
    fn timeout_error_category() {
        let e = ScriptError::Timeout { limit_ms: 5000 };
        assert_eq!(e.category(), ErrorCategory::Timeout);
        assert_eq!(e.category().as_str(), "timeout");
    }

    #[test]
    fn runtime_error_is_classified_from_message() {
        let e = ScriptError::Runtime("script read blocked: path outside allowlist".into());
        assert_eq!(e.category(), ErrorCategory::PermissionDenied);
    }
}
