//! # Upstream Event Bridge
//!
//! Subscribes to the upstream log channel, normalizes every payload, records it into
//! the [`MetricsAggregator`] and fans it out through the [`Dispatcher`]: always to
//! `log_stream`, and as an alert to `notifications` for error and critical events.
//!
//! ## Lifecycle
//!
//! `Disconnected` is the initial state. A successful connect moves the bridge to
//! `Subscribed`, where it consumes messages until the subscription drops and it falls
//! back to `Disconnected`. Failed or dropped subscriptions are retried after a
//! [`ReconnectBackoff`] delay. `Stopping` is terminal and entered through
//! [`EventBridge::stop`]; the subscription is closed on every exit path.
//!
//! The transport sits behind [`UpstreamConnector`], so the loop can be driven by
//! [`RedisConnector`] in production and by an in-memory connector in tests.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::Dispatcher;
use crate::core::event::{AlertNotification, NormalizedLogEvent, OutboundMessage};
use crate::core::metrics::MetricsAggregator;
use crate::errors::{ConfigError, MalformedMessage, TransportError};
use crate::ingestors::backoff::ReconnectBackoff;
use crate::ingestors::normalize::normalize;
use crate::{DEFAULT_UPSTREAM_CHANNEL, LOG_STREAM_CHANNEL, NOTIFICATIONS_CHANNEL};

// Longest raw payload prefix echoed into debug logs.
const RAW_LOG_PREVIEW: usize = 256;

/// Upstream connection settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Pub/Sub channel carrying the raw log events.
    pub channel: String,
    /// First reconnect delay.
    pub reconnect_base: Duration,
    /// Reconnect delay cap.
    pub reconnect_max: Duration,
    /// Upper bound on one connect-and-subscribe attempt.
    pub connect_timeout: Duration,
    /// Most payloads folded into one `log_batch` when several are already waiting.
    /// `1` publishes every event on its own as `new_log`.
    pub max_burst: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://redis:6379/0".to_string(),
            channel: DEFAULT_UPSTREAM_CHANNEL.to_string(),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_burst: 1,
        }
    }
}

/// Where the bridge is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Not subscribed; connecting or waiting out a backoff delay.
    Disconnected,
    /// Subscribed and consuming messages.
    Subscribed,
    /// Stop requested. Terminal.
    Stopping,
}

/// Counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Payloads received from upstream, malformed ones included.
    pub received: u64,
    /// Payloads dropped as malformed.
    pub dropped: u64,
    /// Reconnect attempts scheduled after a failed or dropped subscription.
    pub reconnects: u64,
    /// Alerts published to `notifications`.
    pub alerts: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    received: AtomicU64,
    dropped: AtomicU64,
    reconnects: AtomicU64,
    alerts: AtomicU64,
}

/// One live subscription to the upstream channel.
#[async_trait]
pub trait UpstreamSubscription: Send {
    /// The next payload. `None` means the subscription is gone.
    ///
    /// Must be cancel safe: dropping the returned future loses no message.
    async fn next_payload(&mut self) -> Option<Result<String, MalformedMessage>>;

    /// Tears the subscription down.
    async fn close(self);
}

/// Opens subscriptions to the upstream bus.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// The subscription type this connector produces.
    type Subscription: UpstreamSubscription;

    /// Connects and subscribes to `channel`.
    async fn connect(&self, channel: &str) -> Result<Self::Subscription, TransportError>;
}

/// Redis Pub/Sub connector.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: redis::Client,
    connect_timeout: Duration,
}

impl RedisConnector {
    /// Validates `url` and prepares a client. No connection is made yet.
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self, ConfigError> {
        let client = redis::Client::open(url).map_err(|e| ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            connect_timeout,
        })
    }

    /// Builds a connector from a bridge configuration.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, ConfigError> {
        Self::new(&config.redis_url, config.connect_timeout)
    }

    async fn open(&self, channel: &str) -> Result<RedisSubscription, TransportError> {
        // A successful SUBSCRIBE is the reachability check.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| TransportError::Subscribe {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;

        Ok(RedisSubscription {
            channel: channel.to_string(),
            messages: pubsub.into_on_message().boxed(),
        })
    }
}

#[async_trait]
impl UpstreamConnector for RedisConnector {
    type Subscription = RedisSubscription;

    async fn connect(&self, channel: &str) -> Result<RedisSubscription, TransportError> {
        tokio::time::timeout(self.connect_timeout, self.open(channel))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout.as_millis() as u64))?
    }
}

/// A Redis Pub/Sub message stream.
pub struct RedisSubscription {
    channel: String,
    messages: BoxStream<'static, redis::Msg>,
}

#[async_trait]
impl UpstreamSubscription for RedisSubscription {
    async fn next_payload(&mut self) -> Option<Result<String, MalformedMessage>> {
        let msg = self.messages.next().await?;
        Some(msg.get_payload::<String>().map_err(|_| MalformedMessage::Encoding))
    }

    async fn close(self) {
        // Dropping the stream drops the dedicated pub/sub connection.
        drop(self.messages);
        log::debug!("Closed Redis subscription to '{}'", self.channel);
    }
}

enum PumpExit {
    Stopped,
    Dropped,
}

/// The upstream-to-subscribers bridge.
pub struct EventBridge<C: UpstreamConnector> {
    config: BridgeConfig,
    connector: C,
    aggregator: Arc<MetricsAggregator>,
    dispatcher: Arc<Dispatcher>,
    state: watch::Sender<BridgeState>,
    shutdown: CancellationToken,
    stats: StatCounters,
}

impl<C: UpstreamConnector> EventBridge<C> {
    /// Creates a bridge in the `Disconnected` state.
    pub fn new(config: BridgeConfig, connector: C, aggregator: Arc<MetricsAggregator>, dispatcher: Arc<Dispatcher>) -> Self {
        let (state, _) = watch::channel(BridgeState::Disconnected);
        Self {
            config,
            connector,
            aggregator,
            dispatcher,
            state,
            shutdown: CancellationToken::new(),
            stats: StatCounters::default(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// A receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Counters since startup.
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            received: self.stats.received.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
            alerts: self.stats.alerts.load(Ordering::Relaxed),
        }
    }

    /// Requests a stop. [`run`](Self::run) returns once the subscription is closed.
    pub fn stop(&self) {
        self.state.send_replace(BridgeState::Stopping);
        self.shutdown.cancel();
    }

    fn set_state(&self, next: BridgeState) {
        // Stopping is terminal.
        self.state.send_if_modified(|current| {
            if *current == BridgeState::Stopping || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Runs the connect, consume and reconnect cycle until [`stop`](Self::stop).
    pub async fn run(&self) {
        let mut backoff = ReconnectBackoff::new(self.config.reconnect_base, self.config.reconnect_max);
        log::info!("Event bridge starting on upstream channel '{}'", self.config.channel);

        while !self.shutdown.is_cancelled() {
            self.set_state(BridgeState::Disconnected);

            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                attempt = self.connector.connect(&self.config.channel) => attempt,
            };

            match attempt {
                Ok(mut subscription) => {
                    backoff.reset();
                    self.set_state(BridgeState::Subscribed);
                    log::info!("Subscribed to upstream channel '{}'", self.config.channel);

                    let exit = self.pump(&mut subscription).await;
                    subscription.close().await;
                    if let PumpExit::Stopped = exit {
                        break;
                    }
                    self.set_state(BridgeState::Disconnected);
                    log::warn!("Upstream subscription to '{}' dropped", self.config.channel);
                }
                Err(e) => log::error!("Upstream connect failed: {}", e),
            }

            let delay = backoff.next_delay();
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            log::warn!("Reconnecting in {:?}...", delay);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(BridgeState::Stopping);
        log::info!("Event bridge stopped");
    }

    async fn pump(&self, subscription: &mut C::Subscription) -> PumpExit {
        loop {
            let first = tokio::select! {
                _ = self.shutdown.cancelled() => return PumpExit::Stopped,
                next = subscription.next_payload() => next,
            };
            let Some(first) = first else {
                return PumpExit::Dropped;
            };

            let mut burst = Vec::new();
            let mut closed = false;
            let _ = self.accept(first, &mut burst);

            // Fold whatever is already waiting into the same delivery.
            while burst.len() < self.config.max_burst {
                match subscription.next_payload().now_or_never() {
                    Some(Some(next)) => {
                        let _ = self.accept(next, &mut burst);
                    }
                    Some(None) => {
                        closed = true;
                        break;
                    }
                    None => break,
                }
            }

            self.deliver(burst);
            if closed {
                return PumpExit::Dropped;
            }
        }
    }

    // Counts, normalizes and records one payload. Malformed payloads are logged,
    // counted as dropped and returned so callers outside the run loop can see them.
    fn accept(
        &self,
        payload: Result<String, MalformedMessage>,
        burst: &mut Vec<NormalizedLogEvent>,
    ) -> Result<(), MalformedMessage> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        match payload.and_then(|raw| {
            normalize(&raw).inspect_err(|_| {
                let preview: String = raw.chars().take(RAW_LOG_PREVIEW).collect();
                log::debug!("Raw payload: {}", preview);
            })
        }) {
            Ok(event) => {
                self.aggregator.record(&event);
                burst.push(event);
                Ok(())
            }
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping malformed upstream message: {}", e);
                Err(e)
            }
        }
    }

    /// Normalizes, records and fans out one raw payload.
    pub fn process_payload(&self, raw: &str) -> Result<(), MalformedMessage> {
        let mut burst = Vec::with_capacity(1);
        let accepted = self.accept(Ok(raw.to_string()), &mut burst);
        self.deliver(burst);
        accepted
    }

    fn deliver(&self, mut events: Vec<NormalizedLogEvent>) {
        let alerts: Vec<AlertNotification> = events.iter().filter_map(AlertNotification::from_event).collect();

        let published = if events.len() == 1 {
            events
                .pop()
                .map(|event| self.dispatcher.publish(LOG_STREAM_CHANNEL, &OutboundMessage::new_log(event)))
        } else if events.is_empty() {
            None
        } else {
            Some(self.dispatcher.publish_batch(LOG_STREAM_CHANNEL, events))
        };
        if let Some(Err(e)) = published {
            log::error!("Failed to publish to '{}': {}", LOG_STREAM_CHANNEL, e);
        }

        for alert in alerts {
            self.stats.alerts.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.dispatcher.publish(NOTIFICATIONS_CHANNEL, &OutboundMessage::alert(alert)) {
                log::error!("Failed to publish to '{}': {}", NOTIFICATIONS_CHANNEL, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatcher::DispatcherConfig;
    use crate::core::metrics::MetricsConfig;
    use crate::core::registry::ConnectionRegistry;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    // Each connect hands out the next scripted outcome; once the script runs out,
    // connects fail.
    struct ScriptedConnector {
        script: Mutex<VecDeque<Result<mpsc::UnboundedReceiver<String>, TransportError>>>,
        attempts: AtomicU64,
    }

    struct ScriptedSubscription(mpsc::UnboundedReceiver<String>);

    #[async_trait]
    impl UpstreamSubscription for ScriptedSubscription {
        async fn next_payload(&mut self) -> Option<Result<String, MalformedMessage>> {
            self.0.recv().await.map(Ok)
        }

        async fn close(self) {}
    }

    #[async_trait]
    impl UpstreamConnector for ScriptedConnector {
        type Subscription = ScriptedSubscription;

        async fn connect(&self, _channel: &str) -> Result<ScriptedSubscription, TransportError> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(outcome) => outcome.map(ScriptedSubscription),
                None => Err(TransportError::Connect("refused".to_string())),
            }
        }
    }

    fn bridge(
        script: Vec<Result<mpsc::UnboundedReceiver<String>, TransportError>>,
        max_burst: usize,
    ) -> (Arc<EventBridge<ScriptedConnector>>, Arc<Dispatcher>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let aggregator = Arc::new(MetricsAggregator::new(MetricsConfig::default(), Arc::clone(&registry)));
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default(), registry));
        let connector = ScriptedConnector {
            script: Mutex::new(script.into()),
            attempts: AtomicU64::new(0),
        };
        let config = BridgeConfig {
            max_burst,
            ..Default::default()
        };
        (
            Arc::new(EventBridge::new(config, connector, aggregator, Arc::clone(&dispatcher))),
            dispatcher,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<crate::core::dispatcher::Frame>) -> Vec<Value> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| serde_json::from_str(&f).unwrap())
            .collect()
    }

    #[test]
    fn critical_event_goes_to_both_channels() {
        let (bridge, dispatcher) = bridge(vec![], 1);
        let mut logs = dispatcher.connect("l");
        let mut alerts = dispatcher.connect("n");
        dispatcher.subscribe(LOG_STREAM_CHANNEL, "l", None);
        dispatcher.subscribe(NOTIFICATIONS_CHANNEL, "n", None);

        bridge
            .process_payload(r#"{"_id": "c1", "level": "critical", "message": "disk gone"}"#)
            .unwrap();
        bridge.process_payload(r#"{"_id": "i1", "level": "info"}"#).unwrap();

        let logs = drain(&mut logs);
        let alerts = drain(&mut alerts);
        assert_eq!(logs.len(), 2);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0]["data"]["severity"], "critical");
        assert_eq!(alerts[0]["data"]["log_id"], "c1");
        assert_eq!(bridge.stats().alerts, 1);
    }

    #[test]
    fn malformed_payload_is_counted_and_dropped() {
        let (bridge, _) = bridge(vec![], 1);
        assert!(bridge.process_payload("{oops").is_err());
        assert_eq!(
            bridge.stats(),
            BridgeStats {
                received: 1,
                dropped: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff_until_stopped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (bridge, dispatcher) = bridge(vec![Err(TransportError::Closed), Ok(rx)], 1);
        let mut logs = dispatcher.connect("l");
        dispatcher.subscribe(LOG_STREAM_CHANNEL, "l", None);

        let mut state = bridge.watch_state();
        let handle = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.run().await })
        };

        state.wait_for(|s| *s == BridgeState::Subscribed).await.unwrap();
        assert_eq!(bridge.stats().reconnects, 1);

        tx.send(r#"{"level": "Warning", "message": "slow"}"#.to_string()).unwrap();
        let frame = logs.recv().await.unwrap();
        assert!(frame.contains("\"warning\""));

        // Dropping the sender ends the subscription.
        drop(tx);
        state.wait_for(|s| *s == BridgeState::Disconnected).await.unwrap();

        bridge.stop();
        handle.await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Stopping);
        assert!(bridge.connector.attempts.load(Ordering::Relaxed) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_payloads_are_folded_into_a_batch() {
        let (tx, rx) = mpsc::unbounded_channel();
        for i in 0..5 {
            tx.send(format!(r#"{{"_id": "e{}", "level": "info"}}"#, i)).unwrap();
        }
        let (bridge, dispatcher) = bridge(vec![Ok(rx)], 100);
        let mut logs = dispatcher.connect("l");
        dispatcher.subscribe(LOG_STREAM_CHANNEL, "l", None);

        let handle = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.run().await })
        };

        let frame: Value = serde_json::from_str(&logs.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "log_batch");
        assert_eq!(frame["count"], 5);

        bridge.stop();
        handle.await.unwrap();
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_and_streamed_payloads_are_handled_alike() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (bridge, dispatcher) = bridge(vec![Ok(rx)], 1);
        let mut logs = dispatcher.connect("l");
        dispatcher.subscribe(LOG_STREAM_CHANNEL, "l", None);

        assert!(bridge.process_payload("{oops").is_err());
        bridge.process_payload(r#"{"_id": "d1", "level": "error"}"#).unwrap();
        let direct = drain(&mut logs);

        let handle = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move { bridge.run().await })
        };
        tx.send("{oops".to_string()).unwrap();
        tx.send(r#"{"_id": "s1", "level": "error"}"#.to_string()).unwrap();
        let streamed: Value = serde_json::from_str(&logs.recv().await.unwrap()).unwrap();
        bridge.stop();
        handle.await.unwrap();

        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0]["type"], streamed["type"]);
        assert_eq!(direct[0]["data"]["level"], streamed["data"]["level"]);
        assert_eq!(
            bridge.stats(),
            BridgeStats {
                received: 4,
                dropped: 2,
                reconnects: 0,
                alerts: 2,
            }
        );
        assert_eq!(bridge.aggregator.get_metrics().errors_per_minute, 2);
    }

    #[tokio::test]
    async fn refused_redis_connect_is_a_transport_error() {
        let connector = RedisConnector::new("redis://127.0.0.1:1/", Duration::from_secs(2)).unwrap();
        assert!(connector.connect("logs").await.is_err());
    }

    #[tokio::test]
    async fn stop_before_run_returns_immediately() {
        let (bridge, _) = bridge(vec![], 1);
        bridge.stop();
        bridge.run().await;
        assert_eq!(bridge.state(), BridgeState::Stopping);
        assert_eq!(bridge.connector.attempts.load(Ordering::Relaxed), 0);
    }
}
