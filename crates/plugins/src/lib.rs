//! Extension manager: lifecycle of controller-supplied monitors and actions.
//!
//! Monitors run on their own interval timers and feed the telemetry queue;
//! actions run on demand and feed the response queue. Both are validated
//! (platform support, base64 decode, SHA-256 checksum) before anything is
//! stored. The manager is the sole owner of the artifact registries and
//! their timer handles; removal cancels the timer before dropping the
//! entry.

mod manager;
mod shutdown;

pub use manager::{DeploySpec, ExtensionManager};
pub use shutdown::{ShutdownSpec, ShutdownView};
