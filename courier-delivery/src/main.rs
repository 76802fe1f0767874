//! courierd - runs the delivery scheduler over the configured store.

use courier_core::{CourierConfig, CourierResult};
use courier_delivery::{init_tracing, TelemetryConfig, WebhookService};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> CourierResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracing(&telemetry_config)?;

    let config = CourierConfig::from_env();
    config.validate()?;

    let service = WebhookService::from_config(config).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = service.clone();
    let mut handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    tokio::select! {
        _ = &mut handle => {
            tracing::warn!("Delivery scheduler exited unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            match handle.await {
                Ok(metrics) => {
                    let snapshot = metrics.snapshot();
                    tracing::info!(
                        ticks = snapshot.ticks,
                        delivered = snapshot.delivered,
                        exhausted = snapshot.exhausted,
                        "Delivery scheduler drained"
                    );
                }
                Err(e) => tracing::error!(error = %e, "Delivery scheduler task failed"),
            }
        }
    }

    if telemetry_config.metrics_enabled {
        match service.metrics().render() {
            Ok(text) => tracing::debug!(metrics = %text, "Final metrics"),
            Err(e) => tracing::warn!(error = %e, "Failed to render metrics"),
        }
    }

    Ok(())
}
