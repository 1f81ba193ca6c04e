//! # Metrics Aggregator
//!
//! Live aggregates over the event flow, built from [`SlidingWindowCounter`]s:
//!
//! - a short total-rate window (10s by default) for `logs_per_second`;
//! - 60s windows for errors, warnings and criticals;
//! - lazily created 60s windows per level and per source;
//! - a fixed-capacity ring of per-second history samples for charts.
//!
//! One aggregator serves every producer and reader in the process. Each counter has
//! its own lock, so a single increment is atomic, but a snapshot is not a
//! cross-counter transaction: it reflects whatever each counter holds at the moment
//! it is read.
//!
//! A critical event increments both the critical and the error window, so
//! `errors_per_minute` includes criticals.
//!
//! Keyed counters are evicted once their window empties, and the number of tracked
//! keys is capped so high-cardinality sources cannot grow memory without bound.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::core::event::{LogLevel, NormalizedLogEvent};
use crate::core::registry::ConnectionRegistry;
use crate::core::window::SlidingWindowCounter;
use crate::LOG_STREAM_CHANNEL;

/// Maximum number of entries in `top_sources`.
pub const TOP_SOURCES_LIMIT: usize = 10;

/// Window sizes and bounds for the aggregator.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Window behind `logs_per_second`.
    pub rate_window: Duration,
    /// Window behind the per-minute, per-level and per-source counts.
    pub metrics_window: Duration,
    /// Number of history samples kept.
    pub history_capacity: usize,
    /// Minimum spacing between two history samples.
    pub sample_interval: Duration,
    /// Upper bound on tracked per-source counters.
    pub max_tracked_keys: usize,
    /// Channel whose live connection count is reported as `connected_subscribers`.
    pub subscriber_channel: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            rate_window: Duration::from_secs(10),
            metrics_window: Duration::from_secs(60),
            history_capacity: 300,
            sample_interval: Duration::from_secs(1),
            max_tracked_keys: 1000,
            subscriber_channel: LOG_STREAM_CHANNEL.to_string(),
        }
    }
}

/// One entry of `top_sources`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCount {
    /// Source key (source, else service name, else `unknown`).
    pub source: String,
    /// Events from this source inside the metrics window.
    pub count: usize,
}

/// Derived live metrics. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Total-rate window average, rounded to one decimal.
    pub logs_per_second: f64,
    /// Errors in the metrics window, criticals included.
    pub errors_per_minute: usize,
    /// Warnings in the metrics window.
    pub warnings_per_minute: usize,
    /// Criticals in the metrics window.
    pub criticals_per_minute: usize,
    /// Live connections on the primary log channel.
    pub connected_subscribers: usize,
    /// Busiest sources, at most ten, sorted by count descending.
    pub top_sources: Vec<SourceCount>,
    /// Event count per level; levels with no events are absent.
    pub level_distribution: BTreeMap<LogLevel, usize>,
}

/// One history sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsHistorySample {
    /// Wall-clock time of the sample.
    pub timestamp: DateTime<Utc>,
    /// Total rate at sampling time.
    pub logs_per_second: f64,
    /// Error count at sampling time.
    pub error_count: usize,
}

/// The two chart series, oldest first. Each point serializes as `[timestamp, value]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsHistory {
    /// `logs_per_second` over time.
    pub logs_per_second: Vec<(DateTime<Utc>, f64)>,
    /// `errors_per_minute` over time.
    pub errors_per_minute: Vec<(DateTime<Utc>, usize)>,
}

#[derive(Debug)]
struct HistoryRing {
    samples: VecDeque<MetricsHistorySample>,
    capacity: usize,
    last_sample: Option<Instant>,
}

impl HistoryRing {
    fn push(&mut self, sample: MetricsHistorySample) {
        if self.capacity == 0 {
            return;
        }
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
}

// Lazily created counters keyed by level or source.
#[derive(Debug)]
struct KeyedCounters<K> {
    window: Duration,
    max_keys: usize,
    counters: HashMap<K, SlidingWindowCounter>,
}

impl<K: Eq + Hash + Clone> KeyedCounters<K> {
    fn new(window: Duration, max_keys: usize) -> Self {
        Self {
            window,
            max_keys: max_keys.max(1),
            counters: HashMap::new(),
        }
    }

    fn record(&mut self, key: K, now: Instant) {
        if !self.counters.contains_key(&key) && self.counters.len() >= self.max_keys {
            self.evict_idle(now);
            if self.counters.len() >= self.max_keys {
                self.evict_least_recent();
            }
        }
        let window = self.window;
        self.counters
            .entry(key)
            .or_insert_with(|| SlidingWindowCounter::new(window))
            .add_at(now);
    }

    // Nonzero counts; counters whose window emptied are dropped on the way.
    fn nonzero_counts(&mut self, now: Instant) -> Vec<(K, usize)> {
        let mut counts = Vec::with_capacity(self.counters.len());
        self.counters.retain(|key, counter| {
            let count = counter.count_at(now);
            if count > 0 {
                counts.push((key.clone(), count));
            }
            count > 0
        });
        counts
    }

    fn evict_idle(&mut self, now: Instant) {
        self.counters.retain(|_, counter| counter.count_at(now) > 0);
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .counters
            .iter()
            .min_by_key(|(_, counter)| counter.last_seen())
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.counters.remove(&key);
        }
    }

    fn len(&self) -> usize {
        self.counters.len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Process-wide live metrics over the event flow.
#[derive(Debug)]
pub struct MetricsAggregator {
    config: MetricsConfig,
    registry: Arc<ConnectionRegistry>,
    total: Mutex<SlidingWindowCounter>,
    errors: Mutex<SlidingWindowCounter>,
    warnings: Mutex<SlidingWindowCounter>,
    criticals: Mutex<SlidingWindowCounter>,
    levels: Mutex<KeyedCounters<LogLevel>>,
    sources: Mutex<KeyedCounters<String>>,
    history: Mutex<HistoryRing>,
}

impl MetricsAggregator {
    /// Creates an aggregator reading subscriber counts from `registry`.
    pub fn new(config: MetricsConfig, registry: Arc<ConnectionRegistry>) -> Self {
        let minute = config.metrics_window;
        Self {
            total: Mutex::new(SlidingWindowCounter::new(config.rate_window)),
            errors: Mutex::new(SlidingWindowCounter::new(minute)),
            warnings: Mutex::new(SlidingWindowCounter::new(minute)),
            criticals: Mutex::new(SlidingWindowCounter::new(minute)),
            levels: Mutex::new(KeyedCounters::new(minute, LogLevel::ALL.len())),
            sources: Mutex::new(KeyedCounters::new(minute, config.max_tracked_keys)),
            history: Mutex::new(HistoryRing {
                samples: VecDeque::with_capacity(config.history_capacity),
                capacity: config.history_capacity,
                last_sample: None,
            }),
            registry,
            config,
        }
    }

    /// The configuration this aggregator runs with.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Records one event happening now.
    pub fn record(&self, event: &NormalizedLogEvent) {
        self.record_at(event, Instant::now());
    }

    /// Records one event at `now`.
    pub fn record_at(&self, event: &NormalizedLogEvent, now: Instant) {
        lock(&self.total).add_at(now);
        lock(&self.levels).record(event.level, now);

        match event.level {
            LogLevel::Error => lock(&self.errors).add_at(now),
            LogLevel::Warning => lock(&self.warnings).add_at(now),
            LogLevel::Critical => {
                lock(&self.criticals).add_at(now);
                lock(&self.errors).add_at(now);
            }
            LogLevel::Debug | LogLevel::Info => {}
        }

        lock(&self.sources).record(event.metrics_source().to_string(), now);

        self.maybe_sample(now);
    }

    // Appends a history sample unless one was taken less than a sample interval ago.
    fn maybe_sample(&self, now: Instant) {
        let mut history = lock(&self.history);
        let due = history
            .last_sample
            .map_or(true, |last| now.saturating_duration_since(last) >= self.config.sample_interval);
        if !due {
            return;
        }
        let logs_per_second = lock(&self.total).rate_per_second_at(now);
        let error_count = lock(&self.errors).count_at(now);
        history.push(MetricsHistorySample {
            timestamp: Utc::now(),
            logs_per_second,
            error_count,
        });
        history.last_sample = Some(now);
    }

    /// Current metrics snapshot.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.get_metrics_at(Instant::now())
    }

    /// Metrics snapshot with every window ending at `now`.
    pub fn get_metrics_at(&self, now: Instant) -> MetricsSnapshot {
        let logs_per_second = round_one_decimal(lock(&self.total).rate_per_second_at(now));
        let errors_per_minute = lock(&self.errors).count_at(now);
        let warnings_per_minute = lock(&self.warnings).count_at(now);
        let criticals_per_minute = lock(&self.criticals).count_at(now);

        let level_distribution: BTreeMap<LogLevel, usize> =
            lock(&self.levels).nonzero_counts(now).into_iter().collect();

        let mut top_sources: Vec<SourceCount> = lock(&self.sources)
            .nonzero_counts(now)
            .into_iter()
            .map(|(source, count)| SourceCount { source, count })
            .collect();
        top_sources.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.source.cmp(&b.source)));
        top_sources.truncate(TOP_SOURCES_LIMIT);

        MetricsSnapshot {
            logs_per_second,
            errors_per_minute,
            warnings_per_minute,
            criticals_per_minute,
            connected_subscribers: self.registry.get_count(&self.config.subscriber_channel),
            top_sources,
            level_distribution,
        }
    }

    /// Both history series, oldest first.
    pub fn get_history(&self) -> MetricsHistory {
        let history = lock(&self.history);
        MetricsHistory {
            logs_per_second: history
                .samples
                .iter()
                .map(|s| (s.timestamp, s.logs_per_second))
                .collect(),
            errors_per_minute: history
                .samples
                .iter()
                .map(|s| (s.timestamp, s.error_count))
                .collect(),
        }
    }

    /// Span the full history ring covers, in whole minutes.
    pub fn history_duration_minutes(&self) -> u64 {
        let span = self.config.sample_interval.as_secs_f64() * self.config.history_capacity as f64;
        (span / 60.0).round() as u64
    }

    /// Number of per-source counters currently held.
    pub fn tracked_sources(&self) -> usize {
        lock(&self.sources).len()
    }
}
