//! # Periodic Metrics Publisher
//!
//! Pushes a fresh metrics snapshot to every `metrics_stream` subscriber on a fixed
//! interval until cancelled. A failed tick is logged and the loop carries on.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::Dispatcher;
use crate::core::event::OutboundMessage;
use crate::core::metrics::MetricsAggregator;
use crate::errors::DeliveryError;
use crate::METRICS_STREAM_CHANNEL;

/// Publishing cadence and target channel.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Time between two snapshots.
    pub interval: Duration,
    /// Channel the snapshots are published to.
    pub channel: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            channel: METRICS_STREAM_CHANNEL.to_string(),
        }
    }
}

/// Fixed-interval broadcaster of [`MetricsAggregator`] snapshots.
#[derive(Debug)]
pub struct MetricsPublisher {
    config: PublisherConfig,
    aggregator: Arc<MetricsAggregator>,
    dispatcher: Arc<Dispatcher>,
}

impl MetricsPublisher {
    /// Creates a publisher reading from `aggregator` and sending through `dispatcher`.
    pub fn new(config: PublisherConfig, aggregator: Arc<MetricsAggregator>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            aggregator,
            dispatcher,
        }
    }

    /// Publishes one snapshot now. Returns the number of subscribers reached.
    pub fn publish_once(&self) -> Result<usize, DeliveryError> {
        let snapshot = self.aggregator.get_metrics();
        self.dispatcher
            .publish(&self.config.channel, &OutboundMessage::metrics_update(snapshot))
    }

    /// Runs until `shutdown` is cancelled. The first snapshot goes out immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!(
            "Metrics publisher started ({:?} interval, channel '{}')",
            self.config.interval,
            self.config.channel
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    // No subscribers, nothing to compute.
                    if self.dispatcher.registry().get_count(&self.config.channel) == 0 {
                        continue;
                    }
                    match self.publish_once() {
                        Ok(sent) => log::trace!("Metrics snapshot sent to {} subscribers", sent),
                        Err(e) => log::error!("Metrics publish failed: {}", e),
                    }
                }
            }
        }
        log::info!("Metrics publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatcher::DispatcherConfig;
    use crate::core::metrics::MetricsConfig;
    use crate::core::registry::ConnectionRegistry;
    use serde_json::Value;

    fn publisher(interval: Duration) -> (MetricsPublisher, Arc<Dispatcher>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let aggregator = Arc::new(MetricsAggregator::new(MetricsConfig::default(), Arc::clone(&registry)));
        let dispatcher = Arc::new(Dispatcher::new(DispatcherConfig::default(), registry));
        let config = PublisherConfig {
            interval,
            ..Default::default()
        };
        (MetricsPublisher::new(config, aggregator, Arc::clone(&dispatcher)), dispatcher)
    }

    #[test]
    fn publish_once_reaches_metrics_subscribers() {
        let (publisher, dispatcher) = publisher(Duration::from_secs(1));
        let mut rx = dispatcher.connect("m");
        dispatcher.subscribe(METRICS_STREAM_CHANNEL, "m", None);

        assert_eq!(publisher.publish_once().unwrap(), 1);
        let frame: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "metrics_update");
        assert_eq!(frame["data"]["logs_per_second"], 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_until_cancelled() {
        let (publisher, dispatcher) = publisher(Duration::from_secs(1));
        let mut rx = dispatcher.connect("m");
        dispatcher.subscribe(METRICS_STREAM_CHANNEL, "m", None);

        let token = CancellationToken::new();
        let publisher = Arc::new(publisher);
        let handle = {
            let publisher = Arc::clone(&publisher);
            let token = token.clone();
            tokio::spawn(async move { publisher.run(token).await })
        };

        for _ in 0..3 {
            let frame = rx.recv().await.unwrap();
            assert!(frame.contains("\"metrics_update\""));
        }

        token.cancel();
        handle.await.unwrap();
    }
}
