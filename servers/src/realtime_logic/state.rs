use lib_realtime::core::{ConnectionRegistry, Dispatcher, DispatcherConfig, MetricsAggregator, MetricsConfig};
use lib_realtime::ingestors::{EventBridge, RedisConnector};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub aggregator: Arc<MetricsAggregator>,
    // Absent when the gateway runs without an upstream, as in tests.
    pub bridge: Option<Arc<EventBridge<RedisConnector>>>,
}

impl AppState {
    /// Wires a registry, aggregator and dispatcher together.
    pub fn new(metrics: MetricsConfig, dispatcher: DispatcherConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            aggregator: Arc::new(MetricsAggregator::new(metrics, Arc::clone(&registry))),
            dispatcher: Arc::new(Dispatcher::new(dispatcher, registry)),
            bridge: None,
        }
    }

    pub fn with_bridge(mut self, bridge: Arc<EventBridge<RedisConnector>>) -> Self {
        self.bridge = Some(bridge);
        self
    }
}
