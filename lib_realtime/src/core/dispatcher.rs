//! # Filtered Fan-out Dispatcher
//!
//! Delivers one outbound message to every connection registered on a logical
//! channel. Each connection owns a bounded outbox drained by its gateway task, so a
//! slow subscriber can only lose its own messages and never stalls ingestion.
//!
//! ## Delivery rules:
//!
//! 1.  **Encode once**: A message is serialized to JSON a single time and handed out
//!     as a shared [`Frame`]. Only a filtered batch that had to be reduced for one
//!     connection is encoded separately.
//!
//! 2.  **Per-connection filters**: `new_log` and `log_batch` messages pass through the
//!     connection's [`SubscriberFilter`]. Alerts and metrics are never filtered.
//!
//! 3.  **Isolated failures**: A full outbox drops the message for that connection. A
//!     connection that left between the registry snapshot and the send is skipped.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::core::event::{FilterOutcome, NormalizedLogEvent, OutboundMessage, SubscriberFilter};
use crate::core::registry::ConnectionRegistry;
use crate::errors::DeliveryError;

/// A serialized outbound message, shared by every connection that receives it.
pub type Frame = Arc<str>;

/// Outbox sizing and batch splitting.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Frames a connection may have queued before new ones are dropped for it.
    pub outbox_capacity: usize,
    /// Largest number of events carried by one `log_batch` message.
    pub max_batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            max_batch_size: 100,
        }
    }
}

/// Delivery counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Frames accepted into an outbox.
    pub delivered: u64,
    /// Frames dropped because an outbox was full or already closed.
    pub dropped: u64,
}

struct Outbox {
    sender: mpsc::Sender<Frame>,
    filter: Option<SubscriberFilter>,
}

/// Per-connection outboxes plus the channel registry they are addressed through.
pub struct Dispatcher {
    config: DispatcherConfig,
    registry: Arc<ConnectionRegistry>,
    outboxes: RwLock<HashMap<String, Outbox>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("connections", &self.connection_count())
            .finish()
    }
}

fn encode(message: &OutboundMessage) -> Result<Frame, DeliveryError> {
    Ok(Frame::from(serde_json::to_string(message)?))
}

impl Dispatcher {
    /// Creates a dispatcher addressing connections through `registry`.
    pub fn new(config: DispatcherConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            config,
            registry,
            outboxes: RwLock::new(HashMap::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// The registry shared with the metrics aggregator.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Outbox>> {
        self.outboxes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Outbox>> {
        self.outboxes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens an outbox for `connection_id` and returns its receiving half.
    ///
    /// Reconnecting an id replaces its previous outbox and clears its filter.
    pub fn connect(&self, connection_id: &str) -> mpsc::Receiver<Frame> {
        let (sender, receiver) = mpsc::channel(self.config.outbox_capacity.max(1));
        let previous = self.write().insert(
            connection_id.to_string(),
            Outbox {
                sender,
                filter: None,
            },
        );
        if previous.is_some() {
            log::warn!("Connection '{}' reconnected; previous outbox replaced", connection_id);
        }
        receiver
    }

    /// Closes the outbox of `connection_id` and removes it from every channel.
    pub fn disconnect(&self, connection_id: &str) {
        self.write().remove(connection_id);
        let left = self.registry.remove_connection_everywhere(connection_id);
        log::info!("Connection '{}' closed (left {:?})", connection_id, left);
    }

    /// Registers `connection_id` on `channel` and returns the channel's count.
    pub fn subscribe(&self, channel: &str, connection_id: &str, user_id: Option<&str>) -> usize {
        self.registry.add_connection(channel, connection_id, user_id)
    }

    /// Unregisters `connection_id` from `channel` and returns the remaining count.
    pub fn unsubscribe(&self, channel: &str, connection_id: &str) -> usize {
        self.registry.remove_connection(channel, connection_id)
    }

    /// Replaces the filter of `connection_id`. An empty filter clears it.
    ///
    /// Returns `false` when the connection has no outbox.
    pub fn set_filter(&self, connection_id: &str, filter: SubscriberFilter) -> bool {
        match self.write().get_mut(connection_id) {
            Some(outbox) => {
                outbox.filter = if filter.is_empty() { None } else { Some(filter) };
                true
            }
            None => false,
        }
    }

    /// The active filter of `connection_id`, if any.
    pub fn filter(&self, connection_id: &str) -> Option<SubscriberFilter> {
        self.read().get(connection_id).and_then(|outbox| outbox.filter.clone())
    }

    /// Number of open outboxes.
    pub fn connection_count(&self) -> usize {
        self.read().len()
    }

    /// Delivery counters since startup.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn deliver(&self, connection_id: &str, outbox: &Outbox, frame: Frame) -> Result<(), DeliveryError> {
        match outbox.sender.try_send(frame) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(DeliveryError::Full {
                    connection: connection_id.to_string(),
                })
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(DeliveryError::Closed {
                    connection: connection_id.to_string(),
                })
            }
        }
    }

    /// Sends `message` to every connection on `channel` whose filter accepts it.
    ///
    /// Returns how many connections accepted the message. Per-connection failures
    /// are logged and skipped; only an encoding failure aborts the call.
    pub fn publish(&self, channel: &str, message: &OutboundMessage) -> Result<usize, DeliveryError> {
        let members = self.registry.members(channel);
        if members.is_empty() {
            return Ok(0);
        }

        let mut shared: Option<Frame> = None;
        let mut accepted = 0;
        let outboxes = self.read();

        for connection_id in &members {
            let Some(outbox) = outboxes.get(connection_id) else {
                continue;
            };
            let outcome = match &outbox.filter {
                Some(filter) => message.apply_filter(filter),
                None => FilterOutcome::Deliver,
            };
            let frame = match outcome {
                FilterOutcome::Deliver => match &shared {
                    Some(frame) => Arc::clone(frame),
                    None => {
                        let frame = encode(message)?;
                        shared = Some(Arc::clone(&frame));
                        frame
                    }
                },
                FilterOutcome::Reduced(reduced) => encode(&reduced)?,
                FilterOutcome::Skip => continue,
            };
            match self.deliver(connection_id, outbox, frame) {
                Ok(()) => accepted += 1,
                Err(e) => log::debug!("Dropped '{}' on '{}': {}", message.kind(), channel, e),
            }
        }
        Ok(accepted)
    }

    /// Sends `events` to `channel` as `log_batch` messages of at most
    /// `max_batch_size` events each. Returns the total number of deliveries.
    pub fn publish_batch(&self, channel: &str, events: Vec<NormalizedLogEvent>) -> Result<usize, DeliveryError> {
        let chunk = self.config.max_batch_size.max(1);
        let mut accepted = 0;
        let mut events = events.into_iter().peekable();
        while events.peek().is_some() {
            let batch: Vec<NormalizedLogEvent> = events.by_ref().take(chunk).collect();
            accepted += self.publish(channel, &OutboundMessage::log_batch(batch))?;
        }
        Ok(accepted)
    }

    /// Sends `message` to a single connection, bypassing channels and filters.
    pub fn send_to(&self, connection_id: &str, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let frame = encode(message)?;
        let outboxes = self.read();
        let outbox = outboxes.get(connection_id).ok_or_else(|| DeliveryError::Closed {
            connection: connection_id.to_string(),
        })?;
        self.deliver(connection_id, outbox, frame)
    }
}
