//! Delivery Scheduler Background Task
//!
//! Periodically picks due deliveries from the store and dispatches them
//! concurrently. Each tick:
//!
//! 1. Selects up to `batch_size` deliveries with `next_attempt <= now`,
//!    earliest first
//! 2. Drops deliveries whose webhook was deleted or deactivated
//! 3. Dispatches the rest in parallel and waits for every outcome
//! 4. Finalizes successes, reschedules failures through the backoff policy,
//!    and removes deliveries that reached the retry ceiling
//!
//! A tick never overlaps the previous one, so attempt N+1 of a delivery can
//! only start after attempt N has been recorded. The flip side is that a
//! tick lasts as long as its slowest call: one receiver running into its
//! timeout holds back every other due delivery until the batch resolves.
//!
//! Retries are scheduled from the moment the failed attempt resolved, so a
//! slow failure still waits out its full backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use courier_core::{
    backoff, CourierConfig, CourierResult, Delivery, DeliveryAttempt, DeliveryError,
    ExhaustionError, Timestamp, Webhook,
};
use courier_storage::{OutcomeKind, WebhookStore};
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::signals::{CancelReason, DeliverySignal, SignalHub};
use crate::transport::{AttemptOutcome, Dispatcher};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for scheduler activity since startup.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    /// Ticks completed
    pub ticks: AtomicU64,

    /// Attempts sent to the transport
    pub dispatched: AtomicU64,

    /// Deliveries acknowledged with a 2xx
    pub delivered: AtomicU64,

    /// Failed attempts that were rescheduled
    pub retried: AtomicU64,

    /// Deliveries that hit the retry ceiling
    pub exhausted: AtomicU64,

    /// Deliveries dropped because their webhook went away
    pub cancelled: AtomicU64,

    /// Store errors encountered while ticking
    pub errors: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of scheduler metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub ticks: u64,
    pub dispatched: u64,
    pub delivered: u64,
    pub retried: u64,
    pub exhausted: u64,
    pub cancelled: u64,
    pub errors: u64,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    pub delivered: usize,
    pub retried: usize,
    pub exhausted: usize,
    pub cancelled: usize,
    /// In-flight results dropped because the webhook was deleted meanwhile.
    pub discarded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Delivered,
    Retried,
    Exhausted,
    Cancelled,
    Discarded,
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Drives pending deliveries to completion.
#[derive(Clone)]
pub struct DeliveryScheduler {
    store: Arc<dyn WebhookStore>,
    dispatcher: Dispatcher,
    signals: Arc<SignalHub>,
    config: Arc<CourierConfig>,
    metrics: Arc<SchedulerMetrics>,
}

impl DeliveryScheduler {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        dispatcher: Dispatcher,
        signals: Arc<SignalHub>,
        config: Arc<CourierConfig>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            signals,
            config,
            metrics: Arc::new(SchedulerMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run ticks until the shutdown signal is received.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let (shutdown_tx, shutdown_rx) = watch::channel(false);
    /// let scheduler = DeliveryScheduler::new(store, dispatcher, signals, config);
    /// let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
    ///
    /// // Later, trigger shutdown
    /// let _ = shutdown_tx.send(true);
    /// let metrics = handle.await?;
    /// ```
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> Arc<SchedulerMetrics> {
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_retries = self.config.max_retries,
            "Delivery scheduler started"
        );

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // A dropped sender can never signal again.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!("Delivery scheduler shutting down");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.process_due(Utc::now()).await {
                        tracing::error!(error = %e, "Delivery tick failed");
                        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            ticks = snapshot.ticks,
            delivered = snapshot.delivered,
            retried = snapshot.retried,
            exhausted = snapshot.exhausted,
            cancelled = snapshot.cancelled,
            errors = snapshot.errors,
            "Delivery scheduler stopped"
        );

        self.metrics
    }

    /// Perform one tick as of `now`.
    pub async fn process_due(&self, now: Timestamp) -> CourierResult<TickReport> {
        self.metrics.ticks.fetch_add(1, Ordering::Relaxed);
        let due = self.store.delivery_due(now, self.config.batch_size).await?;

        let mut report = TickReport::default();
        let mut batch = Vec::with_capacity(due.len());
        for delivery in due {
            match self.store.webhook_get(delivery.webhook_id).await? {
                Some(webhook) if webhook.active => batch.push((delivery, webhook)),
                Some(_) => {
                    self.cancel(&delivery, CancelReason::WebhookInactive).await?;
                    report.cancelled += 1;
                }
                None => {
                    self.cancel(&delivery, CancelReason::WebhookDeleted).await?;
                    report.cancelled += 1;
                }
            }
        }

        report.dispatched = batch.len();
        self.metrics
            .dispatched
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        let results = join_all(
            batch
                .into_iter()
                .map(|(delivery, webhook)| self.deliver(delivery, webhook)),
        )
        .await;

        for result in results {
            match result {
                Ok(Resolution::Delivered) => report.delivered += 1,
                Ok(Resolution::Retried) => report.retried += 1,
                Ok(Resolution::Exhausted) => report.exhausted += 1,
                Ok(Resolution::Cancelled) => report.cancelled += 1,
                Ok(Resolution::Discarded) => report.discarded += 1,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to record delivery outcome");
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if report.dispatched > 0 || report.cancelled > 0 {
            tracing::debug!(
                dispatched = report.dispatched,
                delivered = report.delivered,
                retried = report.retried,
                exhausted = report.exhausted,
                cancelled = report.cancelled,
                "Delivery tick completed"
            );
        } else {
            tracing::trace!("Delivery tick completed with nothing due");
        }

        Ok(report)
    }

    async fn finish(&self, delivery: &Delivery) -> CourierResult<Option<Delivery>> {
        self.store
            .delivery_finish(delivery.id, self.config.finished_log_retention)
            .await
    }

    async fn cancel(&self, delivery: &Delivery, reason: CancelReason) -> CourierResult<()> {
        if self.finish(delivery).await?.is_some() {
            self.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                delivery_id = %delivery.id,
                webhook_id = %delivery.webhook_id,
                reason = ?reason,
                "Pending delivery cancelled"
            );
            self.signals.emit(DeliverySignal::Cancelled {
                delivery_id: delivery.id,
                webhook_id: delivery.webhook_id,
                reason,
            });
        }
        Ok(())
    }

    async fn deliver(&self, mut delivery: Delivery, webhook: Webhook) -> CourierResult<Resolution> {
        let outcome = self.dispatcher.dispatch(&webhook, &delivery.event).await;
        let attempt_number = delivery.attempts + 1;
        let kind = if outcome.is_success() {
            OutcomeKind::Success
        } else {
            OutcomeKind::Failure
        };

        // A webhook deleted while the call was in flight takes its queue and
        // history with it; the result is dropped.
        let Some(updated) = self
            .store
            .webhook_record_outcome(webhook.id, kind, outcome.completed_at)
            .await?
        else {
            self.finish(&delivery).await?;
            return Ok(Resolution::Discarded);
        };

        // Deleted between the two writes: the purge already ran, so writing
        // the log now would orphan it.
        let recorded = self
            .store
            .attempt_record(
                &delivery,
                &attempt_record(attempt_number, &outcome),
                self.config.attempt_history_limit,
            )
            .await?;
        if !recorded {
            return Ok(Resolution::Discarded);
        }

        match outcome.result {
            Ok(response) => {
                self.finish(&delivery).await?;
                self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    delivery_id = %delivery.id,
                    webhook_id = %webhook.id,
                    attempt = attempt_number,
                    status = response.status,
                    response_time_ms = outcome.response_time_ms,
                    "Webhook delivered"
                );
                self.signals.emit(DeliverySignal::Delivered {
                    delivery_id: delivery.id,
                    webhook_id: webhook.id,
                    tenant_id: delivery.tenant_id(),
                    attempt: attempt_number,
                    status_code: response.status,
                    response_time_ms: outcome.response_time_ms,
                });
                Ok(Resolution::Delivered)
            }
            Err(error) => {
                delivery.attempts = attempt_number;
                delivery.last_attempt = Some(outcome.completed_at);

                if delivery.attempts >= self.config.max_retries {
                    return self.exhaust(&delivery, error).await;
                }
                if !updated.active {
                    self.cancel(&delivery, CancelReason::WebhookInactive).await?;
                    return Ok(Resolution::Cancelled);
                }

                delivery.next_attempt =
                    outcome.completed_at + backoff_delay(attempt_number, &updated);
                if !self.store.delivery_update(&delivery).await? {
                    return Ok(Resolution::Discarded);
                }

                self.metrics.retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    delivery_id = %delivery.id,
                    webhook_id = %webhook.id,
                    attempt = attempt_number,
                    error = %error,
                    next_attempt = %delivery.next_attempt,
                    "Webhook delivery failed, rescheduled"
                );
                self.signals.emit(DeliverySignal::Failed {
                    delivery_id: delivery.id,
                    webhook_id: webhook.id,
                    tenant_id: delivery.tenant_id(),
                    attempt: attempt_number,
                    error,
                    next_attempt: delivery.next_attempt,
                });
                Ok(Resolution::Retried)
            }
        }
    }

    async fn exhaust(&self, delivery: &Delivery, error: DeliveryError) -> CourierResult<Resolution> {
        if self.finish(delivery).await?.is_none() {
            return Ok(Resolution::Discarded);
        }

        let exhaustion = ExhaustionError {
            delivery_id: delivery.id,
            webhook_id: delivery.webhook_id,
            attempts: delivery.attempts,
            last_error: error,
        };
        self.metrics.exhausted.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            delivery_id = %delivery.id,
            webhook_id = %delivery.webhook_id,
            attempts = delivery.attempts,
            error = %exhaustion.last_error,
            "Webhook delivery exhausted"
        );
        self.signals.emit(DeliverySignal::Exhausted {
            tenant_id: delivery.tenant_id(),
            error: exhaustion,
        });
        Ok(Resolution::Exhausted)
    }
}

fn backoff_delay(attempt: u32, webhook: &Webhook) -> chrono::Duration {
    chrono::Duration::milliseconds(backoff::delay_ms(attempt, webhook.retry_policy) as i64)
}

fn attempt_record(attempt_number: u32, outcome: &AttemptOutcome) -> DeliveryAttempt {
    match &outcome.result {
        Ok(response) => DeliveryAttempt {
            attempt_number,
            success: true,
            status_code: Some(response.status),
            error: None,
            response_time_ms: outcome.response_time_ms,
            timestamp: outcome.completed_at,
        },
        Err(error) => DeliveryAttempt {
            attempt_number,
            success: false,
            status_code: error.status_code(),
            error: Some(error.to_string()),
            response_time_ms: outcome.response_time_ms,
            timestamp: outcome.completed_at,
        },
    }
}
