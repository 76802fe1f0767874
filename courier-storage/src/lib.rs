//! COURIER Storage - Store Trait and Implementations
//!
//! Defines the storage abstraction for webhooks, pending deliveries and
//! attempt history. Two implementations are provided:
//!
//! - [`InMemoryStore`]: process memory, lost on restart
//! - [`LmdbStore`]: LMDB environment via heed, survives restart
//!
//! Every mutation that touches a webhook record, its counters or the pending
//! set is performed under a single lock (memory) or write transaction (LMDB),
//! so concurrent configuration edits and delivery outcomes cannot lose
//! updates.
//!
//! Attempt logs are written only while their delivery is pending. Once the
//! delivery is finished its log is retained, and the oldest finished logs
//! are pruned beyond a caller-supplied bound.

pub mod lmdb;
pub mod memory;

pub use lmdb::{LmdbStore, LmdbStoreError};
pub use memory::InMemoryStore;

use async_trait::async_trait;
use courier_core::{
    CourierResult, Delivery, DeliveryAttempt, DeliveryId, TenantId, Timestamp, Webhook, WebhookId,
};
use serde::{Deserialize, Serialize};

/// Outcome applied to a webhook's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Failure,
}

/// In-place edit of a stored webhook, applied inside the store's critical
/// section. An error leaves the stored record untouched.
pub type WebhookEdit<'a> = Box<dyn FnOnce(&mut Webhook) -> CourierResult<()> + Send + 'a>;

/// Attempt history of one delivery.
///
/// Outlives the delivery itself so failures stay inspectable after
/// exhaustion. Dropped when the owning webhook is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptLog {
    pub delivery_id: DeliveryId,
    pub webhook_id: WebhookId,
    pub tenant_id: TenantId,
    /// Oldest first, capped.
    pub attempts: Vec<DeliveryAttempt>,
}

impl AttemptLog {
    pub fn for_delivery(delivery: &Delivery) -> Self {
        Self {
            delivery_id: delivery.id,
            webhook_id: delivery.webhook_id,
            tenant_id: delivery.tenant_id(),
            attempts: Vec::new(),
        }
    }

    /// Append an attempt, dropping the oldest beyond `limit`.
    pub fn push(&mut self, attempt: &DeliveryAttempt, limit: usize) {
        self.attempts.push(attempt.clone());
        if self.attempts.len() > limit {
            let excess = self.attempts.len() - limit;
            self.attempts.drain(..excess);
        }
    }
}

/// Async storage for the delivery subsystem.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    // ========================================================================
    // WEBHOOK OPERATIONS
    // ========================================================================

    /// Insert a new webhook.
    async fn webhook_insert(&self, webhook: &Webhook) -> CourierResult<()>;

    /// Get a webhook by ID.
    async fn webhook_get(&self, id: WebhookId) -> CourierResult<Option<Webhook>>;

    /// Apply `edit` to the stored webhook atomically.
    ///
    /// Returns the record before and after the edit, or None if the webhook
    /// does not exist.
    async fn webhook_modify(
        &self,
        id: WebhookId,
        edit: WebhookEdit<'_>,
    ) -> CourierResult<Option<(Webhook, Webhook)>>;

    /// Delete a webhook together with its pending deliveries and attempt logs.
    ///
    /// Returns the removed webhook and the ids of the purged deliveries.
    async fn webhook_delete(
        &self,
        id: WebhookId,
    ) -> CourierResult<Option<(Webhook, Vec<DeliveryId>)>>;

    /// List every webhook.
    async fn webhook_list(&self) -> CourierResult<Vec<Webhook>>;

    /// List webhooks owned by a tenant.
    async fn webhook_list_by_tenant(&self, tenant_id: TenantId) -> CourierResult<Vec<Webhook>>;

    /// Atomically bump a webhook's success or failure counter.
    ///
    /// Returns the updated webhook, or None if it was deleted meanwhile.
    async fn webhook_record_outcome(
        &self,
        id: WebhookId,
        outcome: OutcomeKind,
        at: Timestamp,
    ) -> CourierResult<Option<Webhook>>;

    // ========================================================================
    // DELIVERY OPERATIONS
    // ========================================================================

    /// Add a delivery to the pending set.
    async fn delivery_enqueue(&self, delivery: &Delivery) -> CourierResult<()>;

    /// Get a pending delivery by ID.
    async fn delivery_get(&self, id: DeliveryId) -> CourierResult<Option<Delivery>>;

    /// Up to `limit` pending deliveries with `next_attempt <= now`, earliest first.
    async fn delivery_due(&self, now: Timestamp, limit: usize) -> CourierResult<Vec<Delivery>>;

    /// Overwrite a pending delivery. Returns false if it was removed meanwhile.
    async fn delivery_update(&self, delivery: &Delivery) -> CourierResult<bool>;

    /// Remove a delivery from the pending set.
    ///
    /// Its attempt log, if any, is kept as finished. The oldest finished logs
    /// beyond `retain_finished` are dropped in the same operation.
    async fn delivery_finish(
        &self,
        id: DeliveryId,
        retain_finished: usize,
    ) -> CourierResult<Option<Delivery>>;

    /// All pending deliveries, earliest `next_attempt` first.
    async fn delivery_list(&self) -> CourierResult<Vec<Delivery>>;

    /// Pending-queue depth.
    async fn delivery_count(&self) -> CourierResult<usize>;

    // ========================================================================
    // ATTEMPT HISTORY
    // ========================================================================

    /// Append an attempt to a delivery's log, keeping the most recent `limit`.
    ///
    /// Returns false without writing when the delivery is no longer pending.
    async fn attempt_record(
        &self,
        delivery: &Delivery,
        attempt: &DeliveryAttempt,
        limit: usize,
    ) -> CourierResult<bool>;

    /// Number of attempt logs kept for finished deliveries.
    async fn finished_log_count(&self) -> CourierResult<usize>;

    /// Attempt log for a delivery, pending or finished.
    async fn attempt_history(&self, delivery_id: DeliveryId) -> CourierResult<Option<AttemptLog>>;
}

/// Order deliveries by due time, breaking ties by ID (UUIDv7 is time-ordered).
pub(crate) fn sort_by_due(deliveries: &mut [Delivery]) {
    deliveries.sort_by(|a, b| {
        a.next_attempt
            .cmp(&b.next_attempt)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn attempt(n: u32) -> DeliveryAttempt {
        DeliveryAttempt {
            attempt_number: n,
            success: false,
            status_code: Some(500),
            error: Some("HTTP 500".to_string()),
            response_time_ms: 5,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_attempt_log_keeps_most_recent() {
        let mut log = AttemptLog {
            delivery_id: Uuid::nil(),
            webhook_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            attempts: Vec::new(),
        };
        for n in 1..=12 {
            log.push(&attempt(n), 10);
        }
        assert_eq!(log.attempts.len(), 10);
        assert_eq!(log.attempts.first().map(|a| a.attempt_number), Some(3));
        assert_eq!(log.attempts.last().map(|a| a.attempt_number), Some(12));
    }
}
