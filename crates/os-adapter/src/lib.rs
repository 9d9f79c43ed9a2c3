//! OS adapter: process-table access and host identity.
//!
//! The rest of the agent only sees the [`ProcessAdapter`] trait; the
//! `sysinfo`-backed implementation lives in [`adapter`]. Host introspection
//! (hostname, platform, machine id) lives in [`host`].

pub mod adapter;
pub mod host;

pub use adapter::{names_match, ProcessAdapter, ProcessInfo, SysinfoAdapter};
