//! Webhook, event and delivery records

use crate::signature::mask_secret;
use crate::{
    new_entity_id, DeliveryId, EventId, TenantId, Timestamp, WebhookId, DEFAULT_TIMEOUT_MS,
    GLOBAL_PATTERN,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Backoff strategy applied between failed delivery attempts.
///
/// Unrecognized policy names deserialize to [`RetryPolicy::Stepped`], which
/// uses the static fallback table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    Linear,
    #[default]
    Exponential,
    Fixed,
    #[serde(other)]
    Stepped,
}

// ============================================================================
// WEBHOOK
// ============================================================================

/// A secret that was replaced by rotation but still verifies until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredSecret {
    pub secret: String,
    pub expires_at: Timestamp,
}

/// A tenant's registered callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub tenant_id: TenantId,
    pub url: String,
    /// Event-type patterns: exact, `*`, or globs such as `order.*`.
    pub events: Vec<String>,
    /// HMAC key. Only ever leaves the process masked, except once at creation
    /// and once at rotation.
    pub secret: String,
    #[serde(default)]
    pub previous_secret: Option<RetiredSecret>,
    pub active: bool,
    /// Extra headers forwarded on every delivery.
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub delivery_count: u64,
    pub failure_count: u64,
    pub last_delivery: Option<Timestamp>,
    pub last_failure: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Webhook {
    /// Count a successful delivery. Counters never decrease.
    pub fn record_success(&mut self, at: Timestamp) {
        self.delivery_count += 1;
        self.last_delivery = Some(at);
    }

    /// Count a failed attempt. Counters never decrease.
    pub fn record_failure(&mut self, at: Timestamp) {
        self.failure_count += 1;
        self.last_failure = Some(at);
    }

    /// Secrets a receiver may legitimately have signed with at `now`.
    pub fn verification_secrets(&self, now: Timestamp) -> Vec<&str> {
        let mut secrets = vec![self.secret.as_str()];
        if let Some(previous) = &self.previous_secret {
            if previous.expires_at > now {
                secrets.push(previous.secret.as_str());
            }
        }
        secrets
    }
}

/// Registration request for a new webhook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub events: Option<Vec<String>>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Perform one synchronous test delivery right after registration.
    #[serde(default)]
    pub test_on_create: bool,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = Some(events.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_test_on_create(mut self) -> Self {
        self.test_on_create = true;
        self
    }

    /// Subscribed patterns, defaulting to the global wildcard.
    pub fn events_or_default(&self) -> Vec<String> {
        match &self.events {
            Some(events) if !events.is_empty() => events.clone(),
            _ => vec![GLOBAL_PATTERN.to_string()],
        }
    }

    pub fn timeout_or_default(&self) -> u64 {
        self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }
}

/// Partial update. Only these fields are mutable after creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookUpdate {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub events: Option<Vec<String>>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl WebhookUpdate {
    pub fn is_empty(&self) -> bool {
        self.url.is_none()
            && self.events.is_none()
            && self.active.is_none()
            && self.headers.is_none()
            && self.timeout_ms.is_none()
            && self.retry_policy.is_none()
    }
}

/// Sanitized webhook returned to callers of the management contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookView {
    pub id: WebhookId,
    pub tenant_id: TenantId,
    pub url: String,
    pub events: Vec<String>,
    pub secret: String,
    pub active: bool,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub delivery_count: u64,
    pub failure_count: u64,
    pub last_delivery: Option<Timestamp>,
    pub last_failure: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_result: Option<TestResult>,
}

impl WebhookView {
    /// View carrying the full secret. Only used for the creation and rotation
    /// responses.
    pub fn revealed(webhook: &Webhook) -> Self {
        let mut view = Self::from(webhook);
        view.secret = webhook.secret.clone();
        view
    }
}

impl From<&Webhook> for WebhookView {
    fn from(webhook: &Webhook) -> Self {
        Self {
            id: webhook.id,
            tenant_id: webhook.tenant_id,
            url: webhook.url.clone(),
            events: webhook.events.clone(),
            secret: mask_secret(&webhook.secret),
            active: webhook.active,
            headers: webhook.headers.clone(),
            timeout_ms: webhook.timeout_ms,
            retry_policy: webhook.retry_policy,
            delivery_count: webhook.delivery_count,
            failure_count: webhook.failure_count,
            last_delivery: webhook.last_delivery,
            last_failure: webhook.last_failure,
            created_at: webhook.created_at,
            updated_at: webhook.updated_at,
            test_result: None,
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// An immutable domain fact published by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: Timestamp,
    pub source: String,
    pub version: String,
}

/// Optional metadata supplied with `publish`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl WebhookEvent {
    pub fn new(
        tenant_id: TenantId,
        event_type: impl Into<String>,
        data: serde_json::Value,
        options: &PublishOptions,
        now: Timestamp,
    ) -> Self {
        Self {
            id: new_entity_id(),
            tenant_id,
            event_type: event_type.into(),
            data,
            timestamp: now,
            source: options
                .source
                .clone()
                .unwrap_or_else(|| crate::DEFAULT_EVENT_SOURCE.to_string()),
            version: options
                .version
                .clone()
                .unwrap_or_else(|| crate::DEFAULT_EVENT_VERSION.to_string()),
        }
    }
}

/// Canonical JSON body sent to receivers. Field order is the wire order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub id: EventId,
    pub event: String,
    pub data: serde_json::Value,
    pub timestamp: Timestamp,
    pub tenant_id: TenantId,
}

impl From<&WebhookEvent> for WebhookPayload {
    fn from(event: &WebhookEvent) -> Self {
        Self {
            id: event.id,
            event: event.event_type.clone(),
            data: event.data.clone(),
            timestamp: event.timestamp,
            tenant_id: event.tenant_id,
        }
    }
}

/// Result of `publish`: how many deliveries were queued, not whether they
/// succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub event_id: EventId,
    pub queued: usize,
}

// ============================================================================
// DELIVERIES
// ============================================================================

/// One webhook's obligation to receive one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub webhook_id: WebhookId,
    pub event: WebhookEvent,
    pub attempts: u32,
    pub queued_at: Timestamp,
    pub next_attempt: Timestamp,
    pub last_attempt: Option<Timestamp>,
}

impl Delivery {
    pub fn new(webhook_id: WebhookId, event: WebhookEvent, now: Timestamp) -> Self {
        Self {
            id: new_entity_id(),
            webhook_id,
            event,
            attempts: 0,
            queued_at: now,
            next_attempt: now,
            last_attempt: None,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.event.tenant_id
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_attempt <= now
    }
}

/// A single try at a delivery, kept for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub attempt_number: u32,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub response_time_ms: u64,
    pub timestamp: Timestamp,
}

/// Result of a synchronous test delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Acknowledgement for `delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReceipt {
    pub success: bool,
}

// ============================================================================
// STATS
// ============================================================================

/// `(deliveries - failures) / deliveries * 100`, or 0 with no deliveries.
pub fn success_rate(delivery_count: u64, failure_count: u64) -> f64 {
    if delivery_count == 0 {
        return 0.0;
    }
    (delivery_count as f64 - failure_count as f64) / delivery_count as f64 * 100.0
}

/// Per-webhook counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookStats {
    pub webhook_id: WebhookId,
    pub delivery_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub last_delivery: Option<Timestamp>,
    pub last_failure: Option<Timestamp>,
    pub active: bool,
}

impl From<&Webhook> for WebhookStats {
    fn from(webhook: &Webhook) -> Self {
        Self {
            webhook_id: webhook.id,
            delivery_count: webhook.delivery_count,
            failure_count: webhook.failure_count,
            success_rate: success_rate(webhook.delivery_count, webhook.failure_count),
            last_delivery: webhook.last_delivery,
            last_failure: webhook.last_failure,
            active: webhook.active,
        }
    }
}

/// System-wide counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub total_webhooks: usize,
    pub active_webhooks: usize,
    pub total_deliveries: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub pending_deliveries: usize,
    pub subscribed_patterns: usize,
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn sample_webhook() -> Webhook {
        let now = Utc::now();
        Webhook {
            id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            url: "https://example.test/hook".to_string(),
            events: vec!["order.*".to_string()],
            secret: "whsec_0123456789abcdef".to_string(),
            previous_secret: None,
            active: true,
            headers: BTreeMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_policy: RetryPolicy::Exponential,
            delivery_count: 0,
            failure_count: 0,
            last_delivery: None,
            last_failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_retry_policy_serialization() {
        assert_eq!(
            serde_json::to_string(&RetryPolicy::Exponential).unwrap(),
            "\"exponential\""
        );
        let linear: RetryPolicy = serde_json::from_str("\"linear\"").unwrap();
        assert_eq!(linear, RetryPolicy::Linear);
    }

    #[test]
    fn test_unknown_retry_policy_falls_back_to_stepped() {
        let policy: RetryPolicy = serde_json::from_str("\"jittered\"").unwrap();
        assert_eq!(policy, RetryPolicy::Stepped);
    }

    #[test]
    fn test_view_masks_secret() {
        let webhook = sample_webhook();
        let view = WebhookView::from(&webhook);
        assert_ne!(view.secret, webhook.secret);
        assert!(view.secret.ends_with("..."));

        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains(&webhook.secret));
        assert!(!json.contains("test_result"));
    }

    #[test]
    fn test_revealed_view_carries_full_secret() {
        let webhook = sample_webhook();
        assert_eq!(WebhookView::revealed(&webhook).secret, webhook.secret);
    }

    #[test]
    fn test_config_defaults() {
        let config = WebhookConfig::new("https://example.test/hook");
        assert_eq!(config.events_or_default(), vec!["*".to_string()]);
        assert_eq!(config.timeout_or_default(), 30_000);

        let config = config.with_events(Vec::<String>::new());
        assert_eq!(config.events_or_default(), vec!["*".to_string()]);
    }

    #[test]
    fn test_payload_field_order() {
        let event = WebhookEvent::new(
            Uuid::nil(),
            "order.created",
            json!({"order": 1}),
            &PublishOptions::default(),
            Utc::now(),
        );
        let body = serde_json::to_string(&WebhookPayload::from(&event)).unwrap();
        let id_pos = body.find("\"id\"").unwrap();
        let event_pos = body.find("\"event\"").unwrap();
        let data_pos = body.find("\"data\"").unwrap();
        let ts_pos = body.find("\"timestamp\"").unwrap();
        let tenant_pos = body.find("\"tenant_id\"").unwrap();
        assert!(id_pos < event_pos && event_pos < data_pos);
        assert!(data_pos < ts_pos && ts_pos < tenant_pos);
    }

    #[test]
    fn test_event_defaults_source_and_version() {
        let event = WebhookEvent::new(
            Uuid::nil(),
            "promotion.started",
            json!({}),
            &PublishOptions::default(),
            Utc::now(),
        );
        assert_eq!(event.source, crate::DEFAULT_EVENT_SOURCE);
        assert_eq!(event.version, crate::DEFAULT_EVENT_VERSION);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "promotion.started");
    }

    #[test]
    fn test_counters_only_increase() {
        let mut webhook = sample_webhook();
        let now = Utc::now();
        webhook.record_success(now);
        webhook.record_failure(now);
        webhook.record_failure(now);
        assert_eq!(webhook.delivery_count, 1);
        assert_eq!(webhook.failure_count, 2);
        assert_eq!(webhook.last_delivery, Some(now));
        assert_eq!(webhook.last_failure, Some(now));
    }

    #[test]
    fn test_success_rate() {
        assert_eq!(success_rate(0, 0), 0.0);
        assert_eq!(success_rate(0, 3), 0.0);
        assert_eq!(success_rate(4, 1), 75.0);
        assert_eq!(success_rate(10, 0), 100.0);
    }

    #[test]
    fn test_verification_secrets_respects_grace() {
        let mut webhook = sample_webhook();
        let now = Utc::now();
        webhook.previous_secret = Some(RetiredSecret {
            secret: "old".to_string(),
            expires_at: now + chrono::Duration::minutes(5),
        });
        assert_eq!(webhook.verification_secrets(now).len(), 2);
        assert_eq!(
            webhook.verification_secrets(now + chrono::Duration::minutes(10)),
            vec![webhook.secret.as_str()]
        );
    }

    #[test]
    fn test_delivery_starts_due() {
        let now = Utc::now();
        let event = WebhookEvent::new(
            Uuid::nil(),
            "order.created",
            json!({}),
            &PublishOptions::default(),
            now,
        );
        let delivery = Delivery::new(Uuid::now_v7(), event, now);
        assert_eq!(delivery.attempts, 0);
        assert_eq!(delivery.queued_at, now);
        assert!(delivery.is_due(now));
        assert!(!delivery.is_due(now - chrono::Duration::milliseconds(1)));
    }
}
