//! Prometheus Metrics Definitions
//!
//! Counters are driven by [`DeliverySignal`]s, so the metrics layer needs no
//! hooks inside the publisher or scheduler.

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

use courier_core::{CourierError, CourierResult};

use crate::signals::{DeliverySignal, SignalObserver};

/// Response time buckets (seconds)
/// Covers: 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s, 30s
const RESPONSE_TIME_BUCKETS: &[f64] = &[
    0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn registration_error(name: &str, e: prometheus::Error) -> CourierError {
    CourierError::Telemetry(format!("Failed to register {}: {}", name, e))
}

/// Container for all COURIER metrics.
///
/// Each instance owns its own [`Registry`], so several services can live in
/// one process without name clashes.
#[derive(Clone)]
pub struct CourierMetrics {
    registry: Registry,

    /// Events accepted by publish
    pub events_published_total: IntCounter,

    /// Attempt outcomes - labels: outcome (success/failure)
    pub deliveries_total: IntCounterVec,

    /// Successful attempt latency
    pub delivery_response_seconds: Histogram,

    /// Deliveries that hit the retry ceiling
    pub exhausted_total: IntCounter,

    /// Pending deliveries dropped - labels: reason
    pub cancelled_total: IntCounterVec,

    /// Deliveries queued and not yet finalized
    pub pending_deliveries: Gauge,
}

impl std::fmt::Debug for CourierMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourierMetrics")
            .field("pending_deliveries", &self.pending_deliveries.get())
            .finish()
    }
}

impl CourierMetrics {
    /// Create and register all metrics on a fresh registry.
    pub fn new() -> CourierResult<Self> {
        let registry = Registry::new();

        let events_published_total = IntCounter::new(
            "courier_events_published_total",
            "Total number of events published",
        )
        .map_err(|e| registration_error("events_published_total", e))?;

        let deliveries_total = IntCounterVec::new(
            Opts::new(
                "courier_deliveries_total",
                "Total webhook delivery attempts",
            ),
            &["outcome"],
        )
        .map_err(|e| registration_error("deliveries_total", e))?;

        let delivery_response_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "courier_delivery_response_seconds",
                "Response time of successful deliveries in seconds",
            )
            .buckets(RESPONSE_TIME_BUCKETS.to_vec()),
        )
        .map_err(|e| registration_error("delivery_response_seconds", e))?;

        let exhausted_total = IntCounter::new(
            "courier_exhausted_total",
            "Total deliveries that exhausted their retries",
        )
        .map_err(|e| registration_error("exhausted_total", e))?;

        let cancelled_total = IntCounterVec::new(
            Opts::new(
                "courier_cancelled_total",
                "Total pending deliveries cancelled",
            ),
            &["reason"],
        )
        .map_err(|e| registration_error("cancelled_total", e))?;

        let pending_deliveries = Gauge::new(
            "courier_pending_deliveries",
            "Current number of pending deliveries",
        )
        .map_err(|e| registration_error("pending_deliveries", e))?;

        registry
            .register(Box::new(events_published_total.clone()))
            .map_err(|e| registration_error("events_published_total", e))?;
        registry
            .register(Box::new(deliveries_total.clone()))
            .map_err(|e| registration_error("deliveries_total", e))?;
        registry
            .register(Box::new(delivery_response_seconds.clone()))
            .map_err(|e| registration_error("delivery_response_seconds", e))?;
        registry
            .register(Box::new(exhausted_total.clone()))
            .map_err(|e| registration_error("exhausted_total", e))?;
        registry
            .register(Box::new(cancelled_total.clone()))
            .map_err(|e| registration_error("cancelled_total", e))?;
        registry
            .register(Box::new(pending_deliveries.clone()))
            .map_err(|e| registration_error("pending_deliveries", e))?;

        Ok(Self {
            registry,
            events_published_total,
            deliveries_total,
            delivery_response_seconds,
            exhausted_total,
            cancelled_total,
            pending_deliveries,
        })
    }

    /// Seed the pending gauge, e.g. after reopening a persistent store.
    pub fn set_pending(&self, count: usize) {
        self.pending_deliveries.set(count as f64);
    }

    /// Prometheus text exposition of every metric.
    pub fn render(&self) -> CourierResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| CourierError::Telemetry(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| CourierError::Telemetry(format!("Metrics are not valid UTF-8: {}", e)))
    }

    fn finalized(&self) {
        if self.pending_deliveries.get() >= 1.0 {
            self.pending_deliveries.dec();
        }
    }
}

impl SignalObserver for CourierMetrics {
    fn on_signal(&self, signal: &DeliverySignal) {
        match signal {
            DeliverySignal::Published { queued, .. } => {
                self.events_published_total.inc();
                self.pending_deliveries.add(*queued as f64);
            }
            DeliverySignal::Delivered {
                response_time_ms, ..
            } => {
                self.deliveries_total
                    .with_label_values(&["success"])
                    .inc();
                self.delivery_response_seconds
                    .observe(*response_time_ms as f64 / 1000.0);
                self.finalized();
            }
            DeliverySignal::Failed { .. } => {
                self.deliveries_total
                    .with_label_values(&["failure"])
                    .inc();
            }
            DeliverySignal::Exhausted { .. } => {
                self.deliveries_total
                    .with_label_values(&["failure"])
                    .inc();
                self.exhausted_total.inc();
                self.finalized();
            }
            DeliverySignal::Cancelled { reason, .. } => {
                let label = match reason {
                    crate::signals::CancelReason::WebhookDeleted => "webhook_deleted",
                    crate::signals::CancelReason::WebhookInactive => "webhook_inactive",
                };
                self.cancelled_total
                    .with_label_values(&[label])
                    .inc();
                self.finalized();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::CancelReason;
    use uuid::Uuid;

    #[test]
    fn test_metrics_creation() {
        let metrics = CourierMetrics::new();
        assert!(metrics.is_ok());
    }

    #[test]
    fn test_two_instances_do_not_clash() {
        assert!(CourierMetrics::new().is_ok());
        assert!(CourierMetrics::new().is_ok());
    }

    #[test]
    fn test_signals_drive_counters() {
        let metrics = CourierMetrics::new().unwrap();
        metrics.on_signal(&DeliverySignal::Published {
            event_id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            event_type: "order.created".to_string(),
            queued: 2,
        });
        assert_eq!(metrics.pending_deliveries.get(), 2.0);

        metrics.on_signal(&DeliverySignal::Delivered {
            delivery_id: Uuid::now_v7(),
            webhook_id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            attempt: 1,
            status_code: 200,
            response_time_ms: 12,
        });
        metrics.on_signal(&DeliverySignal::Cancelled {
            delivery_id: Uuid::now_v7(),
            webhook_id: Uuid::now_v7(),
            reason: CancelReason::WebhookDeleted,
        });

        assert_eq!(metrics.events_published_total.get(), 1);
        assert_eq!(
            metrics
                .deliveries_total
                .with_label_values(&["success"])
                .get(),
            1
        );
        assert_eq!(metrics.pending_deliveries.get(), 0.0);
    }

    #[test]
    fn test_pending_gauge_never_negative() {
        let metrics = CourierMetrics::new().unwrap();
        metrics.on_signal(&DeliverySignal::Cancelled {
            delivery_id: Uuid::now_v7(),
            webhook_id: Uuid::now_v7(),
            reason: CancelReason::WebhookInactive,
        });
        assert_eq!(metrics.pending_deliveries.get(), 0.0);
    }

    #[test]
    fn test_render_text_format() {
        let metrics = CourierMetrics::new().unwrap();
        metrics.events_published_total.inc();
        let text = metrics.render().unwrap();
        assert!(text.contains("courier_events_published_total 1"));
        assert!(text.contains("courier_pending_deliveries"));
    }
}
