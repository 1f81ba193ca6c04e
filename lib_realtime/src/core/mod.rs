//! # Core Engine Module
//!
//! The in-process half of the real-time engine. Everything here is shared by the
//! upstream bridge, the metrics publisher and the subscriber gateway, and every
//! component is safe to use from many tasks at once.
//!
//! ## Core Components:
//!
//! - **`window`**: A time-bounded event counter, the leaf of all live metrics.
//!
//! - **`registry`**: Which subscriber connections are live on which logical channel.
//!
//! - **`metrics`**: Sliding-window aggregates over the event flow, plus a bounded
//!   per-second history for charts.
//!
//! - **`event`**: The canonical log event and the tagged set of outbound messages.
//!
//! - **`dispatcher`**: Per-connection outboxes and filtered fan-out to a channel.
//!
//! - **`publisher`**: The fixed-interval loop that pushes metrics snapshots.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Time-bounded event counter.
pub mod window;
/// Live subscriber connections per logical channel.
pub mod registry;
/// Sliding-window metrics aggregation and history sampling.
pub mod metrics;
/// Normalized events, filters and outbound message kinds.
pub mod event;
/// Filtered fan-out of outbound messages to registered connections.
pub mod dispatcher;
/// Periodic broadcast of metrics snapshots.
pub mod publisher;

// --- Public API Re-exports ---
pub use dispatcher::{DispatchStats, Dispatcher, DispatcherConfig, Frame};
pub use event::{AlertNotification, FilterOutcome, LogLevel, NormalizedLogEvent, OutboundMessage, Severity, SubscriberFilter};
pub use metrics::{MetricsAggregator, MetricsConfig, MetricsHistory, MetricsSnapshot, SourceCount};
pub use publisher::{MetricsPublisher, PublisherConfig};
pub use registry::{ConnectionInfo, ConnectionRegistry};
pub use window::SlidingWindowCounter;
