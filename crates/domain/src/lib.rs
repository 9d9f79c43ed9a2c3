//! Shared domain types for the ProcWarden agent.
//!
//! Everything that crosses a crate boundary lives here: the configuration
//! document, policies, script artifacts, commands, queue entries, and the
//! connection-state model. This crate does no IO.

pub mod artifact;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod plugin_data;
pub mod policy;
pub mod violation;

pub use error::{Error, Result, VerifyDenied};
