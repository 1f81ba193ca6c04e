use anyhow::{Context, Result};
use lib_realtime::core::MetricsPublisher;
use lib_realtime::ingestors::{EventBridge, RedisConnector};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod realtime_logic;
use realtime_logic::{config, downstream, logger, state};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    let settings = config.resolve().context("Invalid configuration")?;
    let log_path = logger::setup_logging(&settings.log_dir, &settings.log_level)?;
    log::info!("Logging to {}", log_path.display());

    let connector = RedisConnector::from_config(&settings.bridge).context("Invalid upstream URL")?;
    let app_state = state::AppState::new(settings.metrics.clone(), settings.dispatcher.clone());
    let bridge = Arc::new(EventBridge::new(
        settings.bridge.clone(),
        connector,
        Arc::clone(&app_state.aggregator),
        Arc::clone(&app_state.dispatcher),
    ));
    let app_state = app_state.with_bridge(Arc::clone(&bridge));

    let shutdown = CancellationToken::new();

    let bridge_handle = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.run().await })
    };

    let publisher_handle = match settings.publisher.clone() {
        Some(publisher_config) => {
            let publisher = MetricsPublisher::new(
                publisher_config,
                Arc::clone(&app_state.aggregator),
                Arc::clone(&app_state.dispatcher),
            );
            let token = shutdown.clone();
            Some(tokio::spawn(async move { publisher.run(token).await }))
        }
        None => {
            log::info!("Metrics broadcast disabled.");
            None
        }
    };

    let downstream_handle = tokio::spawn(downstream::run(settings.port, app_state, shutdown.clone()));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Send shutdown signal to all components
    bridge.stop();
    shutdown.cancel();

    // Wait for components to shut down
    if let Err(e) = bridge_handle.await {
        log::error!("Bridge task failed: {}", e);
    }
    if let Some(handle) = publisher_handle {
        if let Err(e) = handle.await {
            log::error!("Publisher task failed: {}", e);
        }
    }
    match downstream_handle.await {
        Ok(Err(e)) => log::error!("Downstream server failed: {}", e),
        Err(e) => log::error!("Downstream task failed: {}", e),
        Ok(Ok(())) => {}
    }

    log::info!("Shutdown complete.");
    Ok(())
}
