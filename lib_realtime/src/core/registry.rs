//! # Connection Registry
//!
//! Tracks which subscriber connections are live on which logical channel. The
//! gateway layer registers and unregisters connections as sockets come and go; the
//! dispatcher snapshots a channel's members before each fan-out, and the metrics
//! aggregator reads the live subscriber count.
//!
//! All state sits behind a single mutex, so every mutation is linearizable and every
//! read sees a consistent snapshot that includes all mutations that completed before
//! it. A channel whose last connection leaves is removed instead of being kept empty.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// What the registry remembers about one connection on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// The authenticated user behind the connection, when the gateway knows it.
    pub user_id: Option<String>,
    /// When the connection joined the channel.
    pub connected_at: DateTime<Utc>,
}

type ChannelMap = HashMap<String, HashMap<String, ConnectionInfo>>;

/// Live subscriber connections per logical channel.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    channels: Mutex<ChannelMap>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    // Each critical section leaves the map valid, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, ChannelMap> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `connection_id` to `channel` and returns the channel's new count.
    ///
    /// Idempotent: re-adding a present connection keeps its original entry.
    pub fn add_connection(&self, channel: &str, connection_id: &str, user_id: Option<&str>) -> usize {
        let mut channels = self.lock();
        let members = channels.entry(channel.to_string()).or_default();
        members
            .entry(connection_id.to_string())
            .or_insert_with(|| ConnectionInfo {
                user_id: user_id.map(str::to_string),
                connected_at: Utc::now(),
            });
        let count = members.len();
        log::debug!("Connection '{}' joined '{}' ({} live)", connection_id, channel, count);
        count
    }

    /// Removes `connection_id` from `channel` and returns the remaining count.
    ///
    /// Removing an absent connection is a no-op and returns the unchanged count.
    pub fn remove_connection(&self, channel: &str, connection_id: &str) -> usize {
        let mut channels = self.lock();
        let Some(members) = channels.get_mut(channel) else {
            return 0;
        };
        members.remove(connection_id);
        let remaining = members.len();
        if remaining == 0 {
            channels.remove(channel);
        }
        remaining
    }

    /// Removes `connection_id` from every channel it joined and returns those channels.
    pub fn remove_connection_everywhere(&self, connection_id: &str) -> Vec<String> {
        let mut channels = self.lock();
        let mut left = Vec::new();
        channels.retain(|channel, members| {
            if members.remove(connection_id).is_some() {
                left.push(channel.clone());
            }
            !members.is_empty()
        });
        left.sort();
        left
    }

    /// Number of live connections on `channel`.
    pub fn get_count(&self, channel: &str) -> usize {
        self.lock().get(channel).map_or(0, HashMap::len)
    }

    /// Number of live (channel, connection) memberships across all channels.
    pub fn get_total_count(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    /// Live connection count per channel, sorted by channel name.
    pub fn get_all_counts(&self) -> BTreeMap<String, usize> {
        self.lock()
            .iter()
            .map(|(channel, members)| (channel.clone(), members.len()))
            .collect()
    }

    /// Snapshot of the connection ids currently on `channel`.
    pub fn members(&self, channel: &str) -> Vec<String> {
        self.lock()
            .get(channel)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// What is known about `connection_id` on `channel`, if it is registered there.
    pub fn connection_info(&self, channel: &str, connection_id: &str) -> Option<ConnectionInfo> {
        self.lock()
            .get(channel)
            .and_then(|members| members.get(connection_id))
            .cloned()
    }
}
