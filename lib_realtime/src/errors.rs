//! # Error Taxonomy
//!
//! Every failure the engine can observe falls into one of four families. Only
//! [`ConfigError`] is allowed to abort the process, and only before the run loops
//! start; the others are contained where they happen.

use thiserror::Error;

/// The upstream bus is unreachable or the subscription dropped.
///
/// Recovered by the bridge through disconnect and reconnect with backoff.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("failed to connect to upstream: {0}")]
    Connect(String),

    /// Connected, but subscribing to the channel failed.
    #[error("failed to subscribe to '{channel}': {reason}")]
    Subscribe { channel: String, reason: String },

    /// The upstream closed the subscription stream.
    #[error("upstream subscription closed")]
    Closed,

    /// A connect attempt did not finish in time.
    #[error("upstream connect timed out after {0} ms")]
    Timeout(u64),

    #[cfg(feature = "ingestors")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// A single inbound message could not be decoded. It is dropped and logged.
#[derive(Debug, Error)]
pub enum MalformedMessage {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload is not valid UTF-8")]
    Encoding,
}

/// Delivery to a single subscriber failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The outbound message could not be serialized. Affects the whole publish call.
    #[error("failed to encode outbound message: {0}")]
    Encode(#[from] serde_json::Error),

    /// The connection went away between the registry snapshot and the send.
    #[error("connection {connection} is closed")]
    Closed { connection: String },

    /// The connection's outbox is full; the message is dropped for that connection.
    #[error("outbox of connection {connection} is full")]
    Full { connection: String },
}

/// Invalid setup detected at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("reconnect max delay ({max_ms} ms) is below the base delay ({base_ms} ms)")]
    BackoffBounds { base_ms: u64, max_ms: u64 },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("invalid upstream URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}
