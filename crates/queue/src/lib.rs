//! Offline-resilient queues for plugin output.
//!
//! Two durable queues back the upload path: monitor telemetry (keyed by
//! `(plugin_id, artifact_id)`) and action responses (keyed by
//! `trigger_id`). Every append is persisted before the enqueuer is
//! acknowledged; files are rewritten atomically so a crash leaves each
//! record either complete or absent. Delivery is at-least-once: entries
//! stay queued until the controller accepts an upload and the batch is
//! acked.

pub mod fsio;
mod responses;
mod telemetry;

pub use responses::ResponseQueue;
pub use telemetry::TelemetryQueue;
