//! Webhook service facade
//!
//! [`WebhookService`] wires the registry, publisher, scheduler, signal hub
//! and metrics together over one store and one subscription index. It is
//! cheap to clone; clones share all state.

use std::sync::Arc;

use courier_core::{
    CourierConfig, CourierResult, DeleteReceipt, Delivery, DeliveryAttempt, DeliveryId,
    NotFoundError, PublishOptions, PublishReceipt, StorageBackend, SystemStats, TenantId,
    TestResult, Timestamp, Transport, WebhookConfig, WebhookId, WebhookStats, WebhookUpdate,
    WebhookView,
};
use courier_storage::{InMemoryStore, LmdbStore, WebhookStore};
use tokio::sync::{watch, RwLock};

use crate::index::SubscriptionIndex;
use crate::publisher::EventPublisher;
use crate::registry::WebhookRegistry;
use crate::scheduler::{DeliveryScheduler, SchedulerMetrics, TickReport};
use crate::signals::SignalHub;
use crate::stats;
use crate::telemetry::CourierMetrics;
use crate::transport::{Dispatcher, ReqwestTransport};

#[derive(Clone)]
pub struct WebhookService {
    store: Arc<dyn WebhookStore>,
    index: Arc<RwLock<SubscriptionIndex>>,
    registry: WebhookRegistry,
    publisher: EventPublisher,
    scheduler: DeliveryScheduler,
    signals: Arc<SignalHub>,
    metrics: CourierMetrics,
}

impl std::fmt::Debug for WebhookService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookService")
            .field("signals", &self.signals)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl WebhookService {
    /// Build a service over an existing store and transport.
    ///
    /// Validates `config`, then rebuilds the subscription index from the
    /// stored webhooks so a reopened durable store resumes where it stopped.
    pub async fn open(
        config: CourierConfig,
        store: Arc<dyn WebhookStore>,
        transport: Arc<dyn Transport>,
    ) -> CourierResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let index = Arc::new(RwLock::new(SubscriptionIndex::new()));
        let signals = Arc::new(SignalHub::new());
        let dispatcher = Dispatcher::new(transport, config.user_agent.clone());

        let metrics = CourierMetrics::new()?;
        signals.subscribe(Arc::new(metrics.clone()));

        let registry = WebhookRegistry::new(
            Arc::clone(&store),
            Arc::clone(&index),
            dispatcher.clone(),
            Arc::clone(&signals),
            config.default_timeout_ms,
        );
        let publisher =
            EventPublisher::new(Arc::clone(&store), Arc::clone(&index), Arc::clone(&signals));
        let scheduler = DeliveryScheduler::new(
            Arc::clone(&store),
            dispatcher,
            Arc::clone(&signals),
            Arc::clone(&config),
        );

        let webhooks = registry.rebuild_index().await?;
        let pending = store.delivery_count().await?;
        metrics.set_pending(pending);

        tracing::info!(webhooks, pending, "Webhook service opened");

        Ok(Self {
            store,
            index,
            registry,
            publisher,
            scheduler,
            signals,
            metrics,
        })
    }

    /// Build a service with the configured storage backend and the reqwest
    /// transport.
    pub async fn from_config(config: CourierConfig) -> CourierResult<Self> {
        let store: Arc<dyn WebhookStore> = match &config.storage {
            StorageBackend::Memory => Arc::new(InMemoryStore::new()),
            StorageBackend::Lmdb { path, map_size_mb } => {
                tracing::info!(path = %path.display(), map_size_mb, "Opening LMDB store");
                Arc::new(LmdbStore::open(path, *map_size_mb)?)
            }
        };
        let transport = Arc::new(ReqwestTransport::new(&config.user_agent)?);
        Self::open(config, store, transport).await
    }

    // ========================================================================
    // REGISTRY
    // ========================================================================

    pub async fn register_webhook(
        &self,
        tenant_id: TenantId,
        config: WebhookConfig,
    ) -> CourierResult<WebhookView> {
        self.registry.register(tenant_id, config).await
    }

    pub async fn update_webhook(
        &self,
        tenant_id: TenantId,
        id: WebhookId,
        update: WebhookUpdate,
    ) -> CourierResult<WebhookView> {
        self.registry.update(tenant_id, id, update).await
    }

    pub async fn delete_webhook(
        &self,
        tenant_id: TenantId,
        id: WebhookId,
    ) -> CourierResult<DeleteReceipt> {
        self.registry.delete(tenant_id, id).await
    }

    pub async fn get_webhook(&self, tenant_id: TenantId, id: WebhookId) -> CourierResult<WebhookView> {
        self.registry.get(tenant_id, id).await
    }

    pub async fn list_webhooks(&self, tenant_id: TenantId) -> CourierResult<Vec<WebhookView>> {
        self.registry.list(tenant_id).await
    }

    /// Send a synthetic `webhook.test` event right now, outside the queue.
    pub async fn test_webhook(&self, tenant_id: TenantId, id: WebhookId) -> CourierResult<TestResult> {
        self.registry.test(tenant_id, id).await
    }

    pub async fn subscribe(
        &self,
        tenant_id: TenantId,
        id: WebhookId,
        patterns: &[String],
    ) -> CourierResult<WebhookView> {
        self.registry.subscribe(tenant_id, id, patterns).await
    }

    pub async fn unsubscribe(
        &self,
        tenant_id: TenantId,
        id: WebhookId,
        patterns: &[String],
    ) -> CourierResult<WebhookView> {
        self.registry.unsubscribe(tenant_id, id, patterns).await
    }

    /// Replace the signing secret; the old one keeps verifying for `grace`.
    pub async fn rotate_secret(
        &self,
        tenant_id: TenantId,
        id: WebhookId,
        grace: std::time::Duration,
    ) -> CourierResult<WebhookView> {
        self.registry.rotate_secret(tenant_id, id, grace).await
    }

    pub async fn verify_signature(
        &self,
        tenant_id: TenantId,
        id: WebhookId,
        body: &[u8],
        signature: &str,
    ) -> CourierResult<bool> {
        self.registry.verify_signature(tenant_id, id, body, signature).await
    }

    // ========================================================================
    // PUBLISHING
    // ========================================================================

    /// Queue `event_type` for every matching webhook of `tenant_id`.
    pub async fn publish_event(
        &self,
        tenant_id: TenantId,
        event_type: &str,
        data: serde_json::Value,
        options: PublishOptions,
    ) -> CourierResult<PublishReceipt> {
        self.publisher
            .publish(tenant_id, event_type, data, options)
            .await
    }

    /// Webhooks that would receive `event_type` if published now.
    pub async fn resolve(
        &self,
        tenant_id: TenantId,
        event_type: &str,
    ) -> CourierResult<Vec<WebhookView>> {
        let webhooks = self.publisher.resolve(tenant_id, event_type).await?;
        Ok(webhooks.iter().map(WebhookView::from).collect())
    }

    // ========================================================================
    // STATS & DIAGNOSTICS
    // ========================================================================

    pub async fn webhook_stats(&self, tenant_id: TenantId, id: WebhookId) -> CourierResult<WebhookStats> {
        let webhook = self.registry.owned(tenant_id, id).await?;
        Ok(WebhookStats::from(&webhook))
    }

    pub async fn system_stats(&self) -> CourierResult<SystemStats> {
        let index = self.index.read().await;
        stats::system_stats(self.store.as_ref(), &index).await
    }

    /// Recorded attempts of one delivery, oldest first.
    pub async fn delivery_attempts(
        &self,
        tenant_id: TenantId,
        delivery_id: DeliveryId,
    ) -> CourierResult<Vec<DeliveryAttempt>> {
        match self.store.attempt_history(delivery_id).await? {
            Some(log) if log.tenant_id == tenant_id => Ok(log.attempts),
            _ => Err(NotFoundError::delivery(delivery_id).into()),
        }
    }

    /// Pending deliveries of `tenant_id`, earliest `next_attempt` first.
    pub async fn pending_deliveries(&self, tenant_id: TenantId) -> CourierResult<Vec<Delivery>> {
        let all = self.store.delivery_list().await?;
        Ok(all
            .into_iter()
            .filter(|delivery| delivery.tenant_id() == tenant_id)
            .collect())
    }

    // ========================================================================
    // SCHEDULING
    // ========================================================================

    /// Run one scheduler tick as of `now`.
    pub async fn process_due(&self, now: Timestamp) -> CourierResult<TickReport> {
        self.scheduler.process_due(now).await
    }

    /// Drive the scheduler until `shutdown_rx` flips to true.
    pub async fn run(&self, shutdown_rx: watch::Receiver<bool>) -> Arc<SchedulerMetrics> {
        self.scheduler.clone().run(shutdown_rx).await
    }

    pub fn scheduler_metrics(&self) -> Arc<SchedulerMetrics> {
        self.scheduler.metrics()
    }

    pub fn signals(&self) -> &Arc<SignalHub> {
        &self.signals
    }

    pub fn metrics(&self) -> &CourierMetrics {
        &self.metrics
    }
}
