//! # Events and Outbound Messages
//!
//! [`NormalizedLogEvent`] is the one canonical shape every upstream message is mapped
//! onto. Known fields are typed; everything else rides along in `metadata`.
//!
//! [`OutboundMessage`] is the closed set of messages the engine sends to subscribers.
//! Each variant serializes with a `type` tag so the wire shape stays
//! `{type: "...", data: ..., timestamp: ...}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::core::metrics::{MetricsHistory, MetricsSnapshot};

/// Maximum number of characters of an event message copied into an alert.
pub const ALERT_MESSAGE_MAX_CHARS: usize = 200;

/// Severity level of a log event.
///
/// Serializes lower-case. Deserialization accepts the five level names in any
/// casing, see [`LogLevel::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal operation. Also the fallback for missing levels.
    Info,
    /// Something unusual that did not fail.
    Warning,
    /// A failed operation.
    Error,
    /// A failure that needs immediate attention. Counted as an error too.
    Critical,
}

impl LogLevel {
    /// Every level, lowest first.
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Critical,
    ];

    /// Parses a raw level name, ignoring case and surrounding whitespace.
    ///
    /// Only the five canonical names are recognized. Aliases such as `warn` or
    /// `fatal` are not, so they never raise alerts or count as errors.
    pub fn parse(raw: &str) -> Option<LogLevel> {
        let raw = raw.trim();
        LogLevel::ALL
            .into_iter()
            .find(|level| raw.eq_ignore_ascii_case(level.as_str()))
    }

    /// The lower-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        }
    }

    /// Whether events at this level also raise an alert notification.
    pub fn is_alerting(&self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Critical)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        LogLevel::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown log level '{}'", raw)))
    }
}

/// The canonical log event. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedLogEvent {
    /// Upstream id, or a time-derived fallback.
    pub id: String,
    /// Event time as supplied upstream, else the ingestion time (RFC 3339).
    pub timestamp: String,
    /// Normalized severity.
    pub level: LogLevel,
    /// Human-readable message, possibly empty.
    pub message: String,
    /// Emitting host or component.
    pub source: Option<String>,
    /// Logical service name.
    pub service_name: Option<String>,
    /// Deployment environment (e.g. `production`).
    pub environment: Option<String>,
    /// Every raw field that did not map onto a known one.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NormalizedLogEvent {
    /// Key used for per-source metrics: source, else service name, else `"unknown"`.
    pub fn metrics_source(&self) -> &str {
        self.source
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.service_name.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or("unknown")
    }
}

/// Alert severity derived from the event level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Derived from `error` events.
    High,
    /// Derived from `critical` events.
    Critical,
}

/// Alert derived from an error or critical event, published to `notifications`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    /// Alert id; the id of the originating event.
    pub id: String,
    /// `critical` for critical events, `high` for errors.
    pub severity: Severity,
    /// e.g. `"CRITICAL Log Event"`.
    pub title: String,
    /// Event message truncated to [`ALERT_MESSAGE_MAX_CHARS`] characters.
    pub message: String,
    /// Event source, else `"logs"`.
    pub source: String,
    /// Id of the originating event.
    pub log_id: String,
}

impl AlertNotification {
    /// Builds the alert for `event`, or `None` when its level does not alert.
    pub fn from_event(event: &NormalizedLogEvent) -> Option<Self> {
        let severity = match event.level {
            LogLevel::Critical => Severity::Critical,
            LogLevel::Error => Severity::High,
            _ => return None,
        };
        Some(Self {
            id: event.id.clone(),
            severity,
            title: format!("{} Log Event", event.level.as_str().to_uppercase()),
            message: event.message.chars().take(ALERT_MESSAGE_MAX_CHARS).collect(),
            source: event
                .source
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "logs".to_string()),
            log_id: event.id.clone(),
        })
    }
}

/// Per-connection delivery predicate. Every present field must match (AND).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberFilter {
    /// Exact level to accept.
    pub level: Option<LogLevel>,
    /// Exact source to accept.
    pub source: Option<String>,
    /// Exact environment to accept.
    pub environment: Option<String>,
}

impl SubscriberFilter {
    /// True when no condition is configured.
    pub fn is_empty(&self) -> bool {
        self.level.is_none() && self.source.is_none() && self.environment.is_none()
    }

    /// Whether `event` satisfies every configured condition.
    pub fn matches(&self, event: &NormalizedLogEvent) -> bool {
        if let Some(level) = self.level {
            if event.level != level {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if event.source.as_deref() != Some(source.as_str()) {
                return false;
            }
        }
        if let Some(environment) = &self.environment {
            if event.environment.as_deref() != Some(environment.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Everything the engine sends to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// One event on `log_stream`.
    NewLog {
        /// The event.
        data: NormalizedLogEvent,
        /// Send time.
        timestamp: DateTime<Utc>,
    },
    /// A burst of events on `log_stream` delivered as one message.
    LogBatch {
        /// The events, in arrival order.
        data: Vec<NormalizedLogEvent>,
        /// `data.len()`.
        count: usize,
        /// Send time.
        timestamp: DateTime<Utc>,
    },
    /// An alert on `notifications`.
    AlertNotification {
        /// The alert.
        data: AlertNotification,
        /// Send time.
        timestamp: DateTime<Utc>,
    },
    /// A live metrics snapshot on `metrics_stream`.
    MetricsUpdate {
        /// The snapshot.
        data: MetricsSnapshot,
        /// Send time.
        timestamp: DateTime<Utc>,
    },
    /// The sampled history, sent to a connection when it joins `metrics_stream`.
    MetricsHistory {
        /// Both series, oldest first.
        data: MetricsHistory,
        /// Span the history covers at one sample per second.
        duration_minutes: u64,
        /// Send time.
        timestamp: DateTime<Utc>,
    },
}

/// How a subscriber filter affects one outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    /// Deliver the message as is.
    Deliver,
    /// Deliver this reduced message instead.
    Reduced(OutboundMessage),
    /// Do not deliver.
    Skip,
}

impl OutboundMessage {
    /// Wraps a single event for `log_stream`.
    pub fn new_log(event: NormalizedLogEvent) -> Self {
        OutboundMessage::NewLog {
            data: event,
            timestamp: Utc::now(),
        }
    }

    /// Wraps a burst of events for `log_stream`.
    pub fn log_batch(events: Vec<NormalizedLogEvent>) -> Self {
        OutboundMessage::LogBatch {
            count: events.len(),
            data: events,
            timestamp: Utc::now(),
        }
    }

    /// Wraps an alert for `notifications`.
    pub fn alert(alert: AlertNotification) -> Self {
        OutboundMessage::AlertNotification {
            data: alert,
            timestamp: Utc::now(),
        }
    }

    /// Wraps a metrics snapshot for `metrics_stream`.
    pub fn metrics_update(snapshot: MetricsSnapshot) -> Self {
        OutboundMessage::MetricsUpdate {
            data: snapshot,
            timestamp: Utc::now(),
        }
    }

    /// Wraps the metrics history for a newly joined metrics subscriber.
    pub fn metrics_history(history: MetricsHistory, duration_minutes: u64) -> Self {
        OutboundMessage::MetricsHistory {
            data: history,
            duration_minutes,
            timestamp: Utc::now(),
        }
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::NewLog { .. } => "new_log",
            OutboundMessage::LogBatch { .. } => "log_batch",
            OutboundMessage::AlertNotification { .. } => "alert_notification",
            OutboundMessage::MetricsUpdate { .. } => "metrics_update",
            OutboundMessage::MetricsHistory { .. } => "metrics_history",
        }
    }

    /// Applies a subscriber filter. Only messages carrying log events are filtered;
    /// a batch is reduced to its matching events.
    pub fn apply_filter(&self, filter: &SubscriberFilter) -> FilterOutcome {
        if filter.is_empty() {
            return FilterOutcome::Deliver;
        }
        match self {
            OutboundMessage::NewLog { data, .. } => {
                if filter.matches(data) {
                    FilterOutcome::Deliver
                } else {
                    FilterOutcome::Skip
                }
            }
            OutboundMessage::LogBatch { data, timestamp, .. } => {
                let kept: Vec<NormalizedLogEvent> =
                    data.iter().filter(|e| filter.matches(e)).cloned().collect();
                if kept.is_empty() {
                    FilterOutcome::Skip
                } else if kept.len() == data.len() {
                    FilterOutcome::Deliver
                } else {
                    FilterOutcome::Reduced(OutboundMessage::LogBatch {
                        count: kept.len(),
                        data: kept,
                        timestamp: *timestamp,
                    })
                }
            }
            _ => FilterOutcome::Deliver,
        }
    }
}
