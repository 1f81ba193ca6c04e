use lib_realtime::core::{LogLevel, SubscriberFilter};
use lib_realtime::ingestors::BridgeState;
use lib_realtime::{LOG_STREAM_CHANNEL, NOTIFICATIONS_CHANNEL};
use project_tests::{Engine, drain, fast_reconnect, next_frame, payload};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn spawn_bridge(engine: &Engine) -> JoinHandle<()> {
    let bridge = Arc::clone(&engine.bridge);
    tokio::spawn(async move { bridge.run().await })
}

async fn wait_for_state(engine: &Engine, wanted: BridgeState) {
    let mut state = engine.bridge.watch_state();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == wanted))
        .await
        .expect("bridge never reached the expected state")
        .unwrap();
}

#[tokio::test]
async fn critical_event_reaches_log_stream_and_notifications_once() {
    let engine = Engine::new();
    let mut logs = engine.join(LOG_STREAM_CHANNEL, "logs");
    let mut alerts = engine.join(NOTIFICATIONS_CHANNEL, "alerts");
    let upstream = engine.upstream.prepare();
    let handle = spawn_bridge(&engine);
    wait_for_state(&engine, BridgeState::Subscribed).await;

    upstream.send(payload("c-1", "CRITICAL", "db")).unwrap();
    upstream.send(payload("i-1", "info", "web")).unwrap();

    let first = next_frame(&mut logs).await;
    assert_eq!(first["type"], "new_log");
    assert_eq!(first["data"]["level"], "critical");
    let second = next_frame(&mut logs).await;
    assert_eq!(second["data"]["id"], "i-1");

    let alert = next_frame(&mut alerts).await;
    assert_eq!(alert["type"], "alert_notification");
    assert_eq!(alert["data"]["severity"], "critical");
    assert_eq!(alert["data"]["title"], "CRITICAL Log Event");
    assert_eq!(alert["data"]["source"], "db");
    assert_eq!(alert["data"]["log_id"], "c-1");

    engine.bridge.stop();
    handle.await.unwrap();
    assert!(drain(&mut logs).is_empty());
    assert!(drain(&mut alerts).is_empty());
}

#[tokio::test]
async fn level_filter_applies_per_connection() {
    let engine = Engine::new();
    let mut errors_only = engine.join(LOG_STREAM_CHANNEL, "errors-only");
    let mut everything = engine.join(LOG_STREAM_CHANNEL, "everything");
    engine.dispatcher.set_filter(
        "errors-only",
        SubscriberFilter {
            level: Some(LogLevel::Error),
            ..Default::default()
        },
    );

    engine.bridge.process_payload(&payload("w-1", "warning", "api")).unwrap();
    engine.bridge.process_payload(&payload("e-1", "error", "api")).unwrap();

    let filtered = drain(&mut errors_only);
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0]["data"]["id"], "e-1");

    let unfiltered = drain(&mut everything);
    let ids: Vec<_> = unfiltered.iter().map(|f| f["data"]["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["w-1", "e-1"]);
}

#[tokio::test]
async fn non_canonical_levels_raise_no_alerts() {
    let engine = Engine::new();
    let mut logs = engine.join(LOG_STREAM_CHANNEL, "logs");
    let mut alerts = engine.join(NOTIFICATIONS_CHANNEL, "alerts");

    for (i, level) in ["fatal", "alert", "emergency", "err", "verbose"].into_iter().enumerate() {
        engine
            .bridge
            .process_payload(&payload(&format!("n{}", i), level, "api"))
            .unwrap();
    }

    let delivered = drain(&mut logs);
    assert_eq!(delivered.len(), 5);
    for frame in &delivered {
        assert_eq!(frame["data"]["level"], "info");
        assert!(frame["data"]["metadata"]["level_raw"].is_string());
    }
    assert!(drain(&mut alerts).is_empty());
    assert_eq!(engine.bridge.stats().alerts, 0);

    let metrics = engine.aggregator.get_metrics();
    assert_eq!(metrics.errors_per_minute, 0);
    assert_eq!(metrics.criticals_per_minute, 0);
    assert_eq!(metrics.level_distribution.get(&LogLevel::Info), Some(&5));
}

#[tokio::test]
async fn metrics_reflect_a_mixed_burst() {
    let engine = Engine::new();
    let _subscriber = engine.join(LOG_STREAM_CHANNEL, "watcher");

    for i in 0..900 {
        engine.bridge.process_payload(&payload(&format!("w{}", i), "warning", "api")).unwrap();
    }
    for i in 0..100 {
        engine.bridge.process_payload(&payload(&format!("e{}", i), "error", "db")).unwrap();
    }

    let metrics = engine.aggregator.get_metrics();
    assert_eq!(metrics.errors_per_minute, 100);
    assert_eq!(metrics.warnings_per_minute, 900);
    assert_eq!(metrics.criticals_per_minute, 0);
    assert_eq!(metrics.connected_subscribers, 1);
    assert_eq!(metrics.level_distribution.len(), 2);
    assert_eq!(metrics.level_distribution[&LogLevel::Warning], 900);
    assert_eq!(metrics.level_distribution[&LogLevel::Error], 100);
    assert_eq!(metrics.top_sources[0].source, "api");
    assert_eq!(metrics.top_sources[0].count, 900);
    assert_eq!(engine.bridge.stats().alerts, 100);
}

#[tokio::test]
async fn malformed_messages_do_not_stop_the_stream() {
    let engine = Engine::new();
    let mut logs = engine.join(LOG_STREAM_CHANNEL, "logs");
    let upstream = engine.upstream.prepare();
    let handle = spawn_bridge(&engine);
    wait_for_state(&engine, BridgeState::Subscribed).await;

    upstream.send("{not json".to_string()).unwrap();
    upstream.send("[1, 2, 3]".to_string()).unwrap();
    upstream.send(payload("ok-1", "info", "web")).unwrap();

    let frame = next_frame(&mut logs).await;
    assert_eq!(frame["data"]["id"], "ok-1");
    assert_eq!(engine.bridge.state(), BridgeState::Subscribed);

    let stats = engine.bridge.stats();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.dropped, 2);

    engine.bridge.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn bridge_recovers_from_refused_and_dropped_subscriptions() {
    let engine = Engine::with_bridge_config(fast_reconnect());
    let mut logs = engine.join(LOG_STREAM_CHANNEL, "logs");
    engine.upstream.refuse(2);
    let first = engine.upstream.prepare();
    let handle = spawn_bridge(&engine);

    wait_for_state(&engine, BridgeState::Subscribed).await;
    assert_eq!(engine.upstream.attempts(), 3);
    assert_eq!(engine.bridge.stats().reconnects, 2);

    first.send(payload("a", "info", "web")).unwrap();
    assert_eq!(next_frame(&mut logs).await["data"]["id"], "a");

    // The upstream goes away; the next connect gets a fresh subscription.
    let second = engine.upstream.prepare();
    drop(first);
    second.send(payload("b", "info", "web")).unwrap();
    assert_eq!(next_frame(&mut logs).await["data"]["id"], "b");
    assert_eq!(engine.upstream.attempts(), 4);

    engine.bridge.stop();
    handle.await.unwrap();
    assert_eq!(engine.bridge.state(), BridgeState::Stopping);
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_a_backoff_sleep() {
    let engine = Engine::new();
    engine.upstream.refuse(usize::MAX);
    let handle = spawn_bridge(&engine);

    // Let a few attempts fail so the delay grows past the base.
    tokio::time::sleep(Duration::from_secs(8)).await;
    assert!(engine.upstream.attempts() >= 3);
    assert_eq!(engine.bridge.state(), BridgeState::Disconnected);

    engine.bridge.stop();
    tokio::time::timeout(Duration::from_millis(10), handle)
        .await
        .expect("bridge did not stop promptly")
        .unwrap();
}

#[tokio::test]
async fn departed_subscriber_does_not_disturb_the_rest() {
    let engine = Engine::new();
    let gone = engine.join(LOG_STREAM_CHANNEL, "gone");
    let mut stays = engine.join(LOG_STREAM_CHANNEL, "stays");

    // The socket task ended but the gateway has not unregistered it yet.
    drop(gone);
    engine.bridge.process_payload(&payload("x", "info", "web")).unwrap();
    assert_eq!(drain(&mut stays).len(), 1);

    engine.dispatcher.disconnect("gone");
    assert_eq!(engine.registry.get_count(LOG_STREAM_CHANNEL), 1);
    engine.bridge.process_payload(&payload("y", "info", "web")).unwrap();
    assert_eq!(drain(&mut stays).len(), 1);
}
