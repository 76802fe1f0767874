//! COURIER Delivery - Webhook Registry, Publisher and Scheduler
//!
//! Tenants register HTTP endpoints against event-type patterns; published
//! events are fanned out to every matching endpoint as signed JSON POSTs,
//! retried with backoff and reported through [`DeliverySignal`]s.
//!
//! [`WebhookService`] is the entry point. The `courierd` binary runs one
//! service with its scheduler until interrupted.

pub mod index;
pub mod publisher;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod signals;
pub mod stats;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types
pub use index::SubscriptionIndex;
pub use publisher::EventPublisher;
pub use registry::{validate_url, WebhookRegistry};
pub use scheduler::{DeliveryScheduler, SchedulerMetrics, SchedulerSnapshot, TickReport};
pub use service::WebhookService;
pub use signals::{CancelReason, DeliverySignal, SignalHub, SignalObserver};
pub use telemetry::{init_tracing, CourierMetrics, LogFormat, TelemetryConfig};
pub use transport::{build_request, AttemptOutcome, Dispatcher, ReqwestTransport};
