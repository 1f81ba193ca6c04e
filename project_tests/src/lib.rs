//! # Integration Test Fixtures
//!
//! An in-memory upstream bus and a fully wired engine, shared by the tests under
//! `tests/`.

use async_trait::async_trait;
use lib_realtime::core::{
    ConnectionRegistry, Dispatcher, DispatcherConfig, Frame, MetricsAggregator, MetricsConfig,
};
use lib_realtime::errors::{MalformedMessage, TransportError};
use lib_realtime::ingestors::{BridgeConfig, EventBridge, UpstreamConnector, UpstreamSubscription};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct Bus {
    ready: Mutex<VecDeque<mpsc::UnboundedReceiver<String>>>,
    refusals: AtomicUsize,
    attempts: AtomicUsize,
}

/// In-memory upstream. Every connect takes the next prepared subscription; with none
/// prepared, or while refusals are pending, the connect fails.
#[derive(Clone, Default)]
pub struct ChannelConnector {
    bus: Arc<Bus>,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares the subscription handed out by a future connect and returns its publisher.
    pub fn prepare(&self) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus.ready.lock().unwrap().push_back(rx);
        tx
    }

    /// Makes the next `n` connect attempts fail.
    pub fn refuse(&self, n: usize) {
        self.bus.refusals.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.bus.attempts.load(Ordering::SeqCst)
    }
}

pub struct ChannelSubscription(mpsc::UnboundedReceiver<String>);

#[async_trait]
impl UpstreamSubscription for ChannelSubscription {
    async fn next_payload(&mut self) -> Option<Result<String, MalformedMessage>> {
        self.0.recv().await.map(Ok)
    }

    async fn close(mut self) {
        self.0.close();
    }
}

#[async_trait]
impl UpstreamConnector for ChannelConnector {
    type Subscription = ChannelSubscription;

    async fn connect(&self, channel: &str) -> Result<ChannelSubscription, TransportError> {
        self.bus.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .bus
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect(format!("{} refused", channel)));
        }
        self.bus
            .ready
            .lock()
            .unwrap()
            .pop_front()
            .map(ChannelSubscription)
            .ok_or(TransportError::Closed)
    }
}

/// A registry, aggregator, dispatcher and bridge wired the way the server wires them.
pub struct Engine {
    pub registry: Arc<ConnectionRegistry>,
    pub aggregator: Arc<MetricsAggregator>,
    pub dispatcher: Arc<Dispatcher>,
    pub bridge: Arc<EventBridge<ChannelConnector>>,
    pub upstream: ChannelConnector,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_bridge_config(BridgeConfig::default())
    }

    pub fn with_bridge_config(config: BridgeConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let aggregator = Arc::new(MetricsAggregator::new(MetricsConfig::default(), Arc::clone(&registry)));
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default(), Arc::clone(&registry)));
        let upstream = ChannelConnector::new();
        let bridge = Arc::new(EventBridge::new(
            config,
            upstream.clone(),
            Arc::clone(&aggregator),
            Arc::clone(&dispatcher),
        ));
        Self {
            registry,
            aggregator,
            dispatcher,
            bridge,
            upstream,
        }
    }

    /// Connects `id` and joins it to `channel`.
    pub fn join(&self, channel: &str, id: &str) -> mpsc::Receiver<Frame> {
        let rx = self.dispatcher.connect(id);
        self.dispatcher.subscribe(channel, id, None);
        rx
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Short reconnect delays for tests that run on the real clock.
pub fn fast_reconnect() -> BridgeConfig {
    BridgeConfig {
        reconnect_base: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(40),
        ..Default::default()
    }
}

/// A Logstash-style payload.
pub fn payload(id: &str, level: &str, source: &str) -> String {
    json!({
        "_id": id,
        "@timestamp": "2024-05-01T12:00:00Z",
        "parsed": {"level": level, "message": format!("{} from {}", level, source), "source": source},
    })
    .to_string()
}

/// Every frame already queued, decoded.
pub fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .map(|frame| serde_json::from_str(&frame).unwrap())
        .collect()
}

/// Waits for the next frame, failing the test after a second.
pub async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("outbox closed");
    serde_json::from_str(&frame).unwrap()
}
