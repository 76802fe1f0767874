//! Event publisher
//!
//! Resolves an event's subscribers and queues one delivery per match. Whether
//! those deliveries eventually succeed is reported through signals, never
//! through the publish result.

use std::sync::Arc;

use chrono::Utc;
use courier_core::{
    CourierResult, Delivery, PublishOptions, PublishReceipt, TenantId, ValidationError, Webhook,
    WebhookEvent,
};
use courier_storage::WebhookStore;
use tokio::sync::RwLock;

use crate::index::SubscriptionIndex;
use crate::signals::{DeliverySignal, SignalHub};

#[derive(Clone)]
pub struct EventPublisher {
    store: Arc<dyn WebhookStore>,
    index: Arc<RwLock<SubscriptionIndex>>,
    signals: Arc<SignalHub>,
}

impl EventPublisher {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        index: Arc<RwLock<SubscriptionIndex>>,
        signals: Arc<SignalHub>,
    ) -> Self {
        Self {
            store,
            index,
            signals,
        }
    }

    /// Active webhooks of `tenant_id` subscribed to `event_type`, in id order.
    pub async fn resolve(
        &self,
        tenant_id: TenantId,
        event_type: &str,
    ) -> CourierResult<Vec<Webhook>> {
        let candidates = self.index.read().await.candidates(event_type);

        let mut matched = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(webhook) = self.store.webhook_get(id).await? {
                if webhook.tenant_id == tenant_id && webhook.active {
                    matched.push(webhook);
                }
            }
        }
        matched.sort_by_key(|w| w.id);
        Ok(matched)
    }

    /// Publish an event. Zero subscribers is a normal outcome.
    pub async fn publish(
        &self,
        tenant_id: TenantId,
        event_type: &str,
        data: serde_json::Value,
        options: PublishOptions,
    ) -> CourierResult<PublishReceipt> {
        if event_type.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "type".to_string(),
            }
            .into());
        }

        let now = Utc::now();
        let event = WebhookEvent::new(tenant_id, event_type, data, &options, now);
        let subscribers = self.resolve(tenant_id, event_type).await?;

        for webhook in &subscribers {
            let delivery = Delivery::new(webhook.id, event.clone(), now);
            self.store.delivery_enqueue(&delivery).await?;
            tracing::debug!(
                delivery_id = %delivery.id,
                webhook_id = %webhook.id,
                event_id = %event.id,
                "Delivery queued"
            );
        }

        let queued = subscribers.len();
        tracing::info!(
            event_id = %event.id,
            tenant_id = %tenant_id,
            event_type = %event_type,
            queued,
            "Event published"
        );
        self.signals.emit(DeliverySignal::Published {
            event_id: event.id,
            tenant_id,
            event_type: event_type.to_string(),
            queued,
        });

        Ok(PublishReceipt {
            event_id: event.id,
            queued,
        })
    }
}
