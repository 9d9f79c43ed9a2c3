/// Shared error type used across all ProcWarden crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("agent not configured: {0}")]
    Unconfigured(String),

    #[error("discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    #[error("controller not found: {0}")]
    ControllerNotFound(String),

    #[error("controller verification failed: {0}")]
    ParentUnverified(VerifyDenied),

    #[error("transport: {0}")]
    Transport(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("checksum verification failed: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("platform {current} not supported (artifact supports: {supported:?})")]
    UnsupportedPlatform {
        current: String,
        supported: Vec<String>,
    },

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("OS adapter: {0}")]
    OsAdapter(String),

    #[error("command {command_id}: {message}")]
    CommandDispatch { command_id: String, message: String },

    #[error("{0}")]
    Other(String),
}

/// Why a controller handshake was rejected. Carried inside
/// [`Error::ParentUnverified`] so callers can log a discriminating reason
/// without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyDenied {
    /// No pinned public key in the configuration.
    NoPinnedKey,
    /// The handshake request itself failed.
    NetworkError,
    /// The handshake payload was missing fields or undecodable.
    MalformedResponse,
    /// The challenge timestamp is in the future.
    ClockSkew,
    /// The challenge timestamp is older than the replay window.
    StaleChallenge,
    /// The signature does not verify against the pinned key.
    SignatureMismatch,
}

impl std::fmt::Display for VerifyDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VerifyDenied::NoPinnedKey => "no pinned public key",
            VerifyDenied::NetworkError => "network error",
            VerifyDenied::MalformedResponse => "malformed handshake response",
            VerifyDenied::ClockSkew => "challenge timestamp in the future",
            VerifyDenied::StaleChallenge => "stale challenge",
            VerifyDenied::SignatureMismatch => "signature mismatch",
        };
        f.write_str(s)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
