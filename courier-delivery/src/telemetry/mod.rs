//! COURIER Telemetry - Logging and Metrics
//!
//! Structured logging through `tracing-subscriber` and Prometheus counters
//! fed from delivery signals. Both work without any external collector.

pub mod metrics;
pub mod tracer;

pub use metrics::CourierMetrics;
pub use tracer::{init_tracing, LogFormat, TelemetryConfig};
