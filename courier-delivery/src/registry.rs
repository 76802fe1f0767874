//! Webhook registry
//!
//! CRUD over tenant webhooks, kept in step with the subscription index.
//! Every id-addressed call takes the caller's tenant; a webhook owned by a
//! different tenant is indistinguishable from one that does not exist.
//!
//! Edits run inside the store's critical section through
//! [`WebhookStore::webhook_modify`], so concurrent edits of one webhook
//! compose instead of overwriting each other. Edits that can change the
//! subscribed patterns hold the index write lock across the store write and
//! apply the stored before/after difference, keeping index edges and stored
//! `events` in the same order.

use std::sync::Arc;

use chrono::Utc;
use courier_core::pattern::validate_patterns;
use courier_core::signature::{generate_secret, verify};
use courier_core::{
    new_entity_id, CourierResult, DeleteReceipt, DeliveryError, NotFoundError, PublishOptions,
    RetiredSecret, TenantId, TestResult, ValidationError, Webhook, WebhookConfig, WebhookEvent,
    WebhookId, WebhookUpdate, WebhookView, TEST_EVENT_TYPE,
};
use courier_storage::{WebhookEdit, WebhookStore};
use serde_json::json;
use tokio::sync::RwLock;

use crate::index::SubscriptionIndex;
use crate::signals::{CancelReason, DeliverySignal, SignalHub};
use crate::transport::{validate_headers, Dispatcher};

/// Reject anything that is not an absolute http(s) URL with a host.
pub fn validate_url(raw: &str) -> Result<String, ValidationError> {
    if raw.trim().is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: "url".to_string(),
        });
    }
    let url = reqwest::Url::parse(raw.trim()).map_err(|e| ValidationError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {:?}", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(ValidationError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url.to_string())
}

fn validate_timeout(timeout_ms: u64) -> Result<(), ValidationError> {
    if timeout_ms == 0 {
        return Err(ValidationError::InvalidValue {
            field: "timeout_ms".to_string(),
            reason: "timeout must be positive".to_string(),
        });
    }
    Ok(())
}

fn validate_events(events: &[String]) -> Result<(), ValidationError> {
    if events.is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: "events".to_string(),
        });
    }
    validate_patterns(events)
}

/// Move `id`'s index edges from `before` to `after`.
fn sync_index(
    index: &mut SubscriptionIndex,
    id: WebhookId,
    before: &[String],
    after: &[String],
) -> Result<(), ValidationError> {
    let removed: Vec<String> = before
        .iter()
        .filter(|p| !after.contains(p))
        .cloned()
        .collect();
    let added: Vec<String> = after
        .iter()
        .filter(|p| !before.contains(p))
        .cloned()
        .collect();
    index.unsubscribe(id, &removed);
    index.subscribe(id, &added)
}

fn dedup(patterns: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        if !out.contains(&pattern) {
            out.push(pattern);
        }
    }
    out
}

/// Tenant-scoped webhook CRUD.
#[derive(Clone)]
pub struct WebhookRegistry {
    store: Arc<dyn WebhookStore>,
    index: Arc<RwLock<SubscriptionIndex>>,
    dispatcher: Dispatcher,
    signals: Arc<SignalHub>,
    default_timeout_ms: u64,
}

impl WebhookRegistry {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        index: Arc<RwLock<SubscriptionIndex>>,
        dispatcher: Dispatcher,
        signals: Arc<SignalHub>,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            store,
            index,
            dispatcher,
            signals,
            default_timeout_ms,
        }
    }

    /// Rebuild the index from every stored webhook. Returns the number
    /// indexed.
    pub async fn rebuild_index(&self) -> CourierResult<usize> {
        let webhooks = self.store.webhook_list().await?;
        let mut index = self.index.write().await;
        index.clear();
        for webhook in &webhooks {
            index.subscribe(webhook.id, &webhook.events)?;
        }
        Ok(webhooks.len())
    }

    /// Fetch a webhook owned by `tenant_id`.
    pub async fn owned(&self, tenant_id: TenantId, id: WebhookId) -> CourierResult<Webhook> {
        match self.store.webhook_get(id).await? {
            Some(webhook) if webhook.tenant_id == tenant_id => Ok(webhook),
            _ => Err(NotFoundError::webhook(id).into()),
        }
    }

    /// Register a webhook. The returned view is the only one that carries
    /// the full secret.
    pub async fn register(
        &self,
        tenant_id: TenantId,
        config: WebhookConfig,
    ) -> CourierResult<WebhookView> {
        let url = validate_url(&config.url)?;
        let events = dedup(config.events_or_default());
        validate_events(&events)?;
        let headers = config.headers.clone().unwrap_or_default();
        validate_headers(&headers)?;
        let timeout_ms = config.timeout_ms.unwrap_or(self.default_timeout_ms);
        validate_timeout(timeout_ms)?;
        let secret = match config.secret {
            Some(secret) if secret.is_empty() => {
                return Err(ValidationError::InvalidValue {
                    field: "secret".to_string(),
                    reason: "secret must not be empty".to_string(),
                }
                .into())
            }
            Some(secret) => secret,
            None => generate_secret(),
        };

        let now = Utc::now();
        let webhook = Webhook {
            id: new_entity_id(),
            tenant_id,
            url,
            events,
            secret,
            previous_secret: None,
            active: true,
            headers,
            timeout_ms,
            retry_policy: config.retry_policy.unwrap_or_default(),
            delivery_count: 0,
            failure_count: 0,
            last_delivery: None,
            last_failure: None,
            created_at: now,
            updated_at: now,
        };

        self.store.webhook_insert(&webhook).await?;
        self.index
            .write()
            .await
            .subscribe(webhook.id, &webhook.events)?;

        tracing::info!(
            webhook_id = %webhook.id,
            tenant_id = %tenant_id,
            url = %webhook.url,
            events = ?webhook.events,
            "Webhook registered"
        );

        let mut view = WebhookView::revealed(&webhook);
        if config.test_on_create {
            view.test_result = Some(self.send_test(&webhook).await);
        }
        Ok(view)
    }

    /// Apply a partial update. Only url, events, active, headers, timeout and
    /// retry policy may change.
    pub async fn update(
        &self,
        tenant_id: TenantId,
        id: WebhookId,
        update: WebhookUpdate,
    ) -> CourierResult<WebhookView> {
        if update.is_empty() {
            return self.get(tenant_id, id).await;
        }

        let url = update.url.as_deref().map(validate_url).transpose()?;
        let events = match update.events {
            Some(events) => {
                let events = dedup(events);
                validate_events(&events)?;
                Some(events)
            }
            None => None,
        };
        if let Some(headers) = &update.headers {
            validate_headers(headers)?;
        }
        if let Some(timeout_ms) = update.timeout_ms {
            validate_timeout(timeout_ms)?;
        }

        let mut index = self.index.write().await;
        let (before, after) = self
            .modify(
                tenant_id,
                id,
                Box::new(move |webhook: &mut Webhook| -> CourierResult<()> {
                    if let Some(url) = url {
                        webhook.url = url;
                    }
                    if let Some(events) = events {
                        webhook.events = events;
                    }
                    if let Some(headers) = update.headers {
                        webhook.headers = headers;
                    }
                    if let Some(timeout_ms) = update.timeout_ms {
                        webhook.timeout_ms = timeout_ms;
                    }
                    if let Some(policy) = update.retry_policy {
                        webhook.retry_policy = policy;
                    }
                    if let Some(active) = update.active {
                        webhook.active = active;
                    }
                    webhook.updated_at = Utc::now();
                    Ok(())
                }),
            )
            .await?;
        sync_index(&mut index, id, &before.events, &after.events)?;
        drop(index);

        if before.active && !after.active {
            tracing::info!(webhook_id = %id, "Webhook deactivated");
        } else {
            tracing::info!(webhook_id = %id, "Webhook updated");
        }
        Ok(WebhookView::from(&after))
    }

    /// Delete a webhook, its index edges and its pending deliveries.
    pub async fn delete(&self, tenant_id: TenantId, id: WebhookId) -> CourierResult<DeleteReceipt> {
        self.owned(tenant_id, id).await?;
        let mut index = self.index.write().await;
        let Some((webhook, purged)) = self.store.webhook_delete(id).await? else {
            return Err(NotFoundError::webhook(id).into());
        };
        index.unsubscribe(id, &webhook.events);
        drop(index);

        for delivery_id in &purged {
            self.signals.emit(DeliverySignal::Cancelled {
                delivery_id: *delivery_id,
                webhook_id: id,
                reason: CancelReason::WebhookDeleted,
            });
        }
        tracing::info!(webhook_id = %id, purged = purged.len(), "Webhook removed");
        Ok(DeleteReceipt { success: true })
    }

    pub async fn get(&self, tenant_id: TenantId, id: WebhookId) -> CourierResult<WebhookView> {
        Ok(WebhookView::from(&self.owned(tenant_id, id).await?))
    }

    pub async fn list(&self, tenant_id: TenantId) -> CourierResult<Vec<WebhookView>> {
        let webhooks = self.store.webhook_list_by_tenant(tenant_id).await?;
        Ok(webhooks.iter().map(WebhookView::from).collect())
    }

    /// Add patterns to a webhook's subscription. Idempotent.
    pub async fn subscribe(
        &self,
        tenant_id: TenantId,
        id: WebhookId,
        patterns: &[String],
    ) -> CourierResult<WebhookView> {
        validate_patterns(patterns)?;
        let patterns = dedup(patterns.to_vec());

        let mut index = self.index.write().await;
        let (before, after) = self
            .modify(
                tenant_id,
                id,
                Box::new(move |webhook: &mut Webhook| -> CourierResult<()> {
                    let added: Vec<String> = patterns
                        .into_iter()
                        .filter(|p| !webhook.events.contains(p))
                        .collect();
                    if !added.is_empty() {
                        webhook.events.extend(added);
                        webhook.updated_at = Utc::now();
                    }
                    Ok(())
                }),
            )
            .await?;
        sync_index(&mut index, id, &before.events, &after.events)?;
        drop(index);

        if before.events != after.events {
            tracing::debug!(webhook_id = %id, events = ?after.events, "Webhook subscribed");
        }
        Ok(WebhookView::from(&after))
    }

    /// Remove patterns from a webhook's subscription.
    pub async fn unsubscribe(
        &self,
        tenant_id: TenantId,
        id: WebhookId,
        patterns: &[String],
    ) -> CourierResult<WebhookView> {
        let mut index = self.index.write().await;
        let (before, after) = self
            .modify(
                tenant_id,
                id,
                Box::new(|webhook: &mut Webhook| -> CourierResult<()> {
                    let count = webhook.events.len();
                    webhook.events.retain(|p| !patterns.contains(p));
                    if webhook.events.len() != count {
                        webhook.updated_at = Utc::now();
                    }
                    Ok(())
                }),
            )
            .await?;
        sync_index(&mut index, id, &before.events, &after.events)?;
        drop(index);

        if before.events != after.events {
            tracing::debug!(webhook_id = %id, events = ?after.events, "Webhook unsubscribed");
        }
        Ok(WebhookView::from(&after))
    }

    /// Replace the signing secret. The old one keeps verifying for `grace`.
    ///
    /// Returns the revealed view carrying the new secret.
    pub async fn rotate_secret(
        &self,
        tenant_id: TenantId,
        id: WebhookId,
        grace: std::time::Duration,
    ) -> CourierResult<WebhookView> {
        let grace = chrono::Duration::from_std(grace).map_err(|e| ValidationError::InvalidValue {
            field: "grace".to_string(),
            reason: e.to_string(),
        })?;
        let secret = generate_secret();

        let (_, rotated) = self
            .modify(
                tenant_id,
                id,
                Box::new(move |webhook: &mut Webhook| -> CourierResult<()> {
                    let now = Utc::now();
                    let retired = std::mem::replace(&mut webhook.secret, secret);
                    webhook.previous_secret = Some(RetiredSecret {
                        secret: retired,
                        expires_at: now + grace,
                    });
                    webhook.updated_at = now;
                    Ok(())
                }),
            )
            .await?;

        tracing::info!(webhook_id = %id, grace_secs = grace.num_seconds(), "Webhook secret rotated");
        Ok(WebhookView::revealed(&rotated))
    }

    /// Check a signature against the current secret and any unexpired
    /// previous secret.
    pub async fn verify_signature(
        &self,
        tenant_id: TenantId,
        id: WebhookId,
        body: &[u8],
        signature: &str,
    ) -> CourierResult<bool> {
        let webhook = self.owned(tenant_id, id).await?;
        Ok(webhook
            .verification_secrets(Utc::now())
            .into_iter()
            .any(|secret| verify(secret, body, signature)))
    }

    /// Deliver a synthetic `webhook.test` event synchronously, outside the
    /// queue. Counters are not touched.
    pub async fn test(&self, tenant_id: TenantId, id: WebhookId) -> CourierResult<TestResult> {
        let webhook = self.owned(tenant_id, id).await?;
        Ok(self.send_test(&webhook).await)
    }

    async fn send_test(&self, webhook: &Webhook) -> TestResult {
        let event = WebhookEvent::new(
            webhook.tenant_id,
            TEST_EVENT_TYPE,
            json!({
                "webhook_id": webhook.id,
                "message": "This is a test delivery",
            }),
            &PublishOptions::default(),
            Utc::now(),
        );
        let outcome = self.dispatcher.dispatch(webhook, &event).await;

        tracing::info!(
            webhook_id = %webhook.id,
            success = outcome.is_success(),
            response_time_ms = outcome.response_time_ms,
            "Webhook test delivery"
        );

        match outcome.result {
            Ok(response) => TestResult {
                success: true,
                status_code: Some(response.status),
                response_time_ms: Some(outcome.response_time_ms),
                error: None,
            },
            Err(error) => TestResult {
                success: false,
                status_code: error.status_code(),
                response_time_ms: match error {
                    DeliveryError::HttpStatus { .. } => Some(outcome.response_time_ms),
                    _ => None,
                },
                error: Some(error.to_string()),
            },
        }
    }

    /// Edit a webhook owned by `tenant_id` atomically, returning it before
    /// and after the edit.
    async fn modify(
        &self,
        tenant_id: TenantId,
        id: WebhookId,
        edit: WebhookEdit<'_>,
    ) -> CourierResult<(Webhook, Webhook)> {
        let scoped: WebhookEdit<'_> = Box::new(move |webhook: &mut Webhook| {
            if webhook.tenant_id != tenant_id {
                return Err(NotFoundError::webhook(id).into());
            }
            edit(webhook)
        });
        self.store
            .webhook_modify(id, scoped)
            .await?
            .ok_or_else(|| NotFoundError::webhook(id).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.test/hook").is_ok());
        assert!(validate_url("http://localhost:8080/cb").is_ok());
        assert!(matches!(
            validate_url(""),
            Err(ValidationError::RequiredFieldMissing { .. })
        ));
        assert!(matches!(
            validate_url("not a url"),
            Err(ValidationError::InvalidUrl { .. })
        ));
        assert!(matches!(
            validate_url("ftp://example.test/hook"),
            Err(ValidationError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let out = dedup(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert_eq!(out, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_sync_index_moves_only_changed_edges() {
        let mut index = SubscriptionIndex::new();
        let id = uuid::Uuid::now_v7();
        let before = vec!["order.*".to_string(), "invoice.paid".to_string()];
        let after = vec!["order.*".to_string(), "user.created".to_string()];
        index.subscribe(id, &before).unwrap();

        sync_index(&mut index, id, &before, &after).unwrap();
        assert!(index.subscribers("invoice.paid").is_none());
        assert!(index.candidates("user.created").contains(&id));
        assert!(index.candidates("order.created").contains(&id));
        assert_eq!(index.pattern_count(), 2);
    }

    #[test]
    fn test_validate_timeout() {
        assert!(validate_timeout(0).is_err());
        assert!(validate_timeout(1).is_ok());
    }
}
