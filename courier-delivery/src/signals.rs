//! Delivery lifecycle signals
//!
//! Every state change the publisher and scheduler make is announced as a
//! [`DeliverySignal`]. Observers are plain synchronous callbacks; anything
//! that needs to do real work should take the channel from
//! [`SignalHub::channel`] and drain it on its own task.

use std::sync::{Arc, RwLock};

use courier_core::{
    DeliveryError, DeliveryId, EventId, ExhaustionError, TenantId, Timestamp, WebhookId,
};
use serde::Serialize;
use tokio::sync::mpsc;

/// Why a pending delivery was dropped without being attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    WebhookDeleted,
    WebhookInactive,
}

/// A delivery lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliverySignal {
    /// An event was accepted and fanned out to `queued` deliveries.
    Published {
        event_id: EventId,
        tenant_id: TenantId,
        event_type: String,
        queued: usize,
    },
    /// A delivery was acknowledged with a 2xx.
    Delivered {
        delivery_id: DeliveryId,
        webhook_id: WebhookId,
        tenant_id: TenantId,
        attempt: u32,
        status_code: u16,
        response_time_ms: u64,
    },
    /// An attempt failed and the delivery was rescheduled.
    Failed {
        delivery_id: DeliveryId,
        webhook_id: WebhookId,
        tenant_id: TenantId,
        attempt: u32,
        error: DeliveryError,
        next_attempt: Timestamp,
    },
    /// A delivery hit its retry ceiling and was removed.
    Exhausted {
        tenant_id: TenantId,
        error: ExhaustionError,
    },
    /// A pending delivery was removed because its webhook went away.
    Cancelled {
        delivery_id: DeliveryId,
        webhook_id: WebhookId,
        reason: CancelReason,
    },
}

impl DeliverySignal {
    /// Short name used as a log field and metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            DeliverySignal::Published { .. } => "published",
            DeliverySignal::Delivered { .. } => "delivered",
            DeliverySignal::Failed { .. } => "failed",
            DeliverySignal::Exhausted { .. } => "exhausted",
            DeliverySignal::Cancelled { .. } => "cancelled",
        }
    }
}

/// Receives every signal raised by the hub.
///
/// Called inline on the publishing task; must not block.
pub trait SignalObserver: Send + Sync {
    fn on_signal(&self, signal: &DeliverySignal);
}

struct ChannelObserver {
    tx: mpsc::UnboundedSender<DeliverySignal>,
}

impl SignalObserver for ChannelObserver {
    fn on_signal(&self, signal: &DeliverySignal) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(signal.clone());
    }
}

/// Fan-out point for [`DeliverySignal`]s.
#[derive(Default)]
pub struct SignalHub {
    observers: RwLock<Vec<Arc<dyn SignalObserver>>>,
}

impl std::fmt::Debug for SignalHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHub")
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for all future signals.
    pub fn subscribe(&self, observer: Arc<dyn SignalObserver>) {
        match self.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    /// Register an unbounded channel and return its receiving end.
    pub fn channel(&self) -> mpsc::UnboundedReceiver<DeliverySignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(ChannelObserver { tx }));
        rx
    }

    pub fn observer_count(&self) -> usize {
        match self.observers.read() {
            Ok(observers) => observers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Deliver a signal to every observer.
    pub fn emit(&self, signal: DeliverySignal) {
        tracing::trace!(signal = signal.kind(), "Emitting delivery signal");
        let observers = match self.observers.read() {
            Ok(observers) => observers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for observer in observers {
            observer.on_signal(&signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl SignalObserver for Counter {
        fn on_signal(&self, _signal: &DeliverySignal) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn cancelled() -> DeliverySignal {
        DeliverySignal::Cancelled {
            delivery_id: Uuid::now_v7(),
            webhook_id: Uuid::now_v7(),
            reason: CancelReason::WebhookDeleted,
        }
    }

    #[test]
    fn test_emit_reaches_every_observer() {
        let hub = SignalHub::new();
        let a = Arc::new(Counter::default());
        let b = Arc::new(Counter::default());
        hub.subscribe(a.clone());
        hub.subscribe(b.clone());

        hub.emit(cancelled());
        hub.emit(cancelled());

        assert_eq!(a.0.load(Ordering::Relaxed), 2);
        assert_eq!(b.0.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_channel_receives_signals() {
        let hub = SignalHub::new();
        let mut rx = hub.channel();
        let signal = cancelled();
        hub.emit(signal.clone());
        assert_eq!(rx.recv().await, Some(signal));
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_harmless() {
        let hub = SignalHub::new();
        drop(hub.channel());
        hub.emit(cancelled());
        assert_eq!(hub.observer_count(), 1);
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(cancelled().kind(), "cancelled");
    }
}
