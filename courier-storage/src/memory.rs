//! In-memory store
//!
//! All state sits behind one async `RwLock`, so every trait method is a
//! single critical section. Nothing survives a restart.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use courier_core::{
    CourierResult, Delivery, DeliveryAttempt, DeliveryId, TenantId, Timestamp, Webhook, WebhookId,
};
use tokio::sync::RwLock;

use crate::{sort_by_due, AttemptLog, OutcomeKind, WebhookEdit, WebhookStore};

#[derive(Debug, Default)]
struct Inner {
    webhooks: HashMap<WebhookId, Webhook>,
    deliveries: HashMap<DeliveryId, Delivery>,
    attempts: HashMap<DeliveryId, AttemptLog>,
    /// Logs whose delivery is no longer pending, oldest delivery first.
    finished: BTreeSet<DeliveryId>,
}

/// Process-local [`WebhookStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookStore for InMemoryStore {
    async fn webhook_insert(&self, webhook: &Webhook) -> CourierResult<()> {
        let mut inner = self.inner.write().await;
        inner.webhooks.insert(webhook.id, webhook.clone());
        Ok(())
    }

    async fn webhook_get(&self, id: WebhookId) -> CourierResult<Option<Webhook>> {
        let inner = self.inner.read().await;
        Ok(inner.webhooks.get(&id).cloned())
    }

    async fn webhook_modify(
        &self,
        id: WebhookId,
        edit: WebhookEdit<'_>,
    ) -> CourierResult<Option<(Webhook, Webhook)>> {
        let mut inner = self.inner.write().await;
        let Some(slot) = inner.webhooks.get_mut(&id) else {
            return Ok(None);
        };
        let mut next = slot.clone();
        edit(&mut next)?;
        let before = std::mem::replace(slot, next.clone());
        Ok(Some((before, next)))
    }

    async fn webhook_delete(
        &self,
        id: WebhookId,
    ) -> CourierResult<Option<(Webhook, Vec<DeliveryId>)>> {
        let mut inner = self.inner.write().await;
        let Some(webhook) = inner.webhooks.remove(&id) else {
            return Ok(None);
        };

        let mut purged = Vec::new();
        inner.deliveries.retain(|delivery_id, d| {
            let keep = d.webhook_id != id;
            if !keep {
                purged.push(*delivery_id);
            }
            keep
        });
        let Inner {
            attempts, finished, ..
        } = &mut *inner;
        attempts.retain(|_, log| log.webhook_id != id);
        finished.retain(|delivery_id| attempts.contains_key(delivery_id));

        Ok(Some((webhook, purged)))
    }

    async fn webhook_list(&self) -> CourierResult<Vec<Webhook>> {
        let inner = self.inner.read().await;
        let mut webhooks: Vec<Webhook> = inner.webhooks.values().cloned().collect();
        webhooks.sort_by_key(|w| w.id);
        Ok(webhooks)
    }

    async fn webhook_list_by_tenant(&self, tenant_id: TenantId) -> CourierResult<Vec<Webhook>> {
        let inner = self.inner.read().await;
        let mut webhooks: Vec<Webhook> = inner
            .webhooks
            .values()
            .filter(|w| w.tenant_id == tenant_id)
            .cloned()
            .collect();
        webhooks.sort_by_key(|w| w.id);
        Ok(webhooks)
    }

    async fn webhook_record_outcome(
        &self,
        id: WebhookId,
        outcome: OutcomeKind,
        at: Timestamp,
    ) -> CourierResult<Option<Webhook>> {
        let mut inner = self.inner.write().await;
        let Some(webhook) = inner.webhooks.get_mut(&id) else {
            return Ok(None);
        };
        match outcome {
            OutcomeKind::Success => webhook.record_success(at),
            OutcomeKind::Failure => webhook.record_failure(at),
        }
        Ok(Some(webhook.clone()))
    }

    async fn delivery_enqueue(&self, delivery: &Delivery) -> CourierResult<()> {
        let mut inner = self.inner.write().await;
        inner.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn delivery_get(&self, id: DeliveryId) -> CourierResult<Option<Delivery>> {
        let inner = self.inner.read().await;
        Ok(inner.deliveries.get(&id).cloned())
    }

    async fn delivery_due(&self, now: Timestamp, limit: usize) -> CourierResult<Vec<Delivery>> {
        let inner = self.inner.read().await;
        let mut due: Vec<Delivery> = inner
            .deliveries
            .values()
            .filter(|d| d.is_due(now))
            .cloned()
            .collect();
        sort_by_due(&mut due);
        due.truncate(limit);
        Ok(due)
    }

    async fn delivery_update(&self, delivery: &Delivery) -> CourierResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.deliveries.get_mut(&delivery.id) {
            Some(slot) => {
                *slot = delivery.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delivery_finish(
        &self,
        id: DeliveryId,
        retain_finished: usize,
    ) -> CourierResult<Option<Delivery>> {
        let mut inner = self.inner.write().await;
        let Some(delivery) = inner.deliveries.remove(&id) else {
            return Ok(None);
        };
        if inner.attempts.contains_key(&id) {
            inner.finished.insert(id);
        }
        while inner.finished.len() > retain_finished {
            if let Some(oldest) = inner.finished.pop_first() {
                inner.attempts.remove(&oldest);
            }
        }
        Ok(Some(delivery))
    }

    async fn delivery_list(&self) -> CourierResult<Vec<Delivery>> {
        let inner = self.inner.read().await;
        let mut deliveries: Vec<Delivery> = inner.deliveries.values().cloned().collect();
        sort_by_due(&mut deliveries);
        Ok(deliveries)
    }

    async fn delivery_count(&self) -> CourierResult<usize> {
        Ok(self.inner.read().await.deliveries.len())
    }

    async fn attempt_record(
        &self,
        delivery: &Delivery,
        attempt: &DeliveryAttempt,
        limit: usize,
    ) -> CourierResult<bool> {
        let mut inner = self.inner.write().await;
        if !inner.deliveries.contains_key(&delivery.id) {
            return Ok(false);
        }
        inner
            .attempts
            .entry(delivery.id)
            .or_insert_with(|| AttemptLog::for_delivery(delivery))
            .push(attempt, limit);
        Ok(true)
    }

    async fn finished_log_count(&self) -> CourierResult<usize> {
        Ok(self.inner.read().await.finished.len())
    }

    async fn attempt_history(&self, delivery_id: DeliveryId) -> CourierResult<Option<AttemptLog>> {
        let inner = self.inner.read().await;
        Ok(inner.attempts.get(&delivery_id).cloned())
    }
}
