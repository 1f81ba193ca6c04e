use chrono::{DateTime, Utc};
use lib_realtime::core::SubscriberFilter;
use serde::{Deserialize, Serialize};

/// Control messages a subscriber may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    SetFilters {
        #[serde(default)]
        filters: SubscriberFilter,
    },
    Refresh,
}

impl ClientMessage {
    pub const KINDS: [&'static str; 3] = ["ping", "set_filters", "refresh"];
}

/// Replies sent straight over the socket, outside the channel fan-out.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connection {
        status: &'static str,
        message: String,
        connected_clients: usize,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    FiltersUpdated {
        filters: SubscriberFilter,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn connected(stream: &str, connected_clients: usize) -> Self {
        ServerMessage::Connection {
            status: "connected",
            message: format!("Connected to {}", stream),
            connected_clients,
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong { timestamp: Utc::now() }
    }

    pub fn filters_updated(filters: SubscriberFilter) -> Self {
        ServerMessage::FiltersUpdated {
            filters,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
