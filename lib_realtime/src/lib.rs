//! # lib_realtime
//!
//! The real-time log event distribution engine. Log events arrive from an upstream
//! message bus, get normalized into one canonical schema, feed a set of sliding-window
//! counters, and fan out to subscriber connections grouped by logical channel.
//!
//! Modules are gated by folder-level features:
//!
//! - **`core`** (default): counters, metrics, registry, dispatcher and publisher.
//! - **`ingestors`**: the upstream bridge with its Redis Pub/Sub connector.
//! - **`full`**: everything.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "core")]
pub mod errors;
#[cfg(feature = "ingestors")]
pub mod ingestors;

/// Channel carrying every normalized log event.
pub const LOG_STREAM_CHANNEL: &str = "log_stream";
/// Channel carrying alerts derived from error and critical events.
pub const NOTIFICATIONS_CHANNEL: &str = "notifications";
/// Channel carrying periodic metrics snapshots.
pub const METRICS_STREAM_CHANNEL: &str = "metrics_stream";
/// Upstream Pub/Sub channel the bridge subscribes to by default.
pub const DEFAULT_UPSTREAM_CHANNEL: &str = "logs:realtime";
