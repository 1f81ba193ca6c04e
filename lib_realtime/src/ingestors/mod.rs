//! # Ingestors Module
//!
//! Everything between the upstream message bus and the core engine: turning raw
//! payloads into canonical events, and keeping a resilient subscription alive.
//!
//! ## Contained Modules:
//! - **`normalize`**: Maps a raw Logstash-style JSON payload onto a `NormalizedLogEvent`.
//! - **`backoff`**: The doubling, capped reconnect delay.
//! - **`redis_bridge`**: The bridge run loop, its connector seam and the Redis
//!   Pub/Sub implementation of that seam.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Raw payload normalization.
pub mod normalize;
/// Reconnect delay policy.
pub mod backoff;
/// Upstream subscription and fan-out bridge.
pub mod redis_bridge;

// --- Public API Re-exports ---
pub use backoff::ReconnectBackoff;
pub use normalize::{normalize, normalize_value};
pub use redis_bridge::{
    BridgeConfig, BridgeState, BridgeStats, EventBridge, RedisConnector, RedisSubscription, UpstreamConnector,
    UpstreamSubscription,
};
