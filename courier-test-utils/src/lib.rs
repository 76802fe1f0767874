//! COURIER Test Utilities
//!
//! Shared test infrastructure for the COURIER workspace:
//! - A scriptable mock [`Transport`] that records every request
//! - Proptest generators for patterns, event types and webhooks
//! - Fixtures for common scenarios
//! - Assertions for COURIER error variants

pub use courier_core::{
    CourierConfig, CourierError, CourierResult, DeliveryError, OutboundRequest, RetryPolicy,
    TenantId, Timestamp, Transport, TransportResponse, Webhook, WebhookConfig,
};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

type Scripted = Result<TransportResponse, DeliveryError>;

#[derive(Debug)]
struct MockState {
    script: VecDeque<Scripted>,
    fallback: Scripted,
    requests: Vec<OutboundRequest>,
}

/// In-process [`Transport`] that answers from a script.
///
/// Scripted outcomes are consumed in order; once the script is empty every
/// call returns the fallback. Clones share state, so a test can keep one
/// handle while the service owns another.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    latency: Option<Duration>,
}

impl MockTransport {
    fn with_fallback(fallback: Scripted) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                script: VecDeque::new(),
                fallback,
                requests: Vec::new(),
            })),
            latency: None,
        }
    }

    /// Every call answers 200.
    pub fn ok() -> Self {
        Self::with_status(200)
    }

    /// Every call answers with `status`, classified like a real response.
    pub fn with_status(status: u16) -> Self {
        Self::with_fallback(courier_core::classify_status(status, None))
    }

    /// Every call fails with a 500.
    pub fn failing() -> Self {
        Self::with_fallback(Err(DeliveryError::HttpStatus {
            status: 500,
            reason: "Internal Server Error".to_string(),
        }))
    }

    /// Every call fails with a network error.
    pub fn unreachable() -> Self {
        Self::with_fallback(Err(DeliveryError::Network {
            reason: "connection refused".to_string(),
        }))
    }

    /// Answer with the given statuses in order, then 200.
    pub fn sequence<I: IntoIterator<Item = u16>>(statuses: I) -> Self {
        let mock = Self::ok();
        for status in statuses {
            mock.push(courier_core::classify_status(status, None));
        }
        mock
    }

    /// Delay every answer, to keep calls in flight.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue one scripted outcome.
    pub fn push(&self, outcome: Scripted) {
        self.lock().script.push_back(outcome);
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.lock().requests.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Most recent request, if any.
    pub fn last_request(&self) -> Option<OutboundRequest> {
        self.lock().requests.last().cloned()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, DeliveryError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        state.requests.push(request);
        match state.script.pop_front() {
            Some(outcome) => outcome,
            None => state.fallback.clone(),
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for COURIER inputs.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Generate a random tenant id.
    pub fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate a single dotted-name segment.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,8}"
    }

    /// Generate an event type such as `order.created` or `billing.invoice.paid`.
    pub fn arb_event_type() -> impl Strategy<Value = String> {
        prop::collection::vec(arb_segment(), 1..4).prop_map(|parts| parts.join("."))
    }

    /// Generate a subscription pattern: exact, global, or a prefix glob.
    pub fn arb_pattern() -> impl Strategy<Value = String> {
        prop_oneof![
            arb_event_type(),
            Just("*".to_string()),
            arb_segment().prop_map(|prefix| format!("{prefix}.*")),
        ]
    }

    /// Generate a RetryPolicy variant.
    pub fn arb_retry_policy() -> impl Strategy<Value = RetryPolicy> {
        prop_oneof![
            Just(RetryPolicy::Linear),
            Just(RetryPolicy::Exponential),
            Just(RetryPolicy::Fixed),
            Just(RetryPolicy::Stepped),
        ]
    }

    /// Generate a registration request aimed at a test host.
    pub fn arb_webhook_config() -> impl Strategy<Value = WebhookConfig> {
        (
            prop::collection::vec(arb_pattern(), 1..4),
            proptest::option::of(arb_retry_policy()),
            proptest::option::of(100u64..60_000),
        )
            .prop_map(|(events, policy, timeout)| {
                let mut config =
                    WebhookConfig::new("https://example.test/hook").with_events(events);
                config.retry_policy = policy;
                config.timeout_ms = timeout;
                config
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common testing scenarios.

    use super::*;
    use serde_json::{json, Value};
    use uuid::Uuid;

    pub const TEST_URL: &str = "https://example.test/hook";

    /// Fresh tenant id.
    pub fn tenant() -> TenantId {
        Uuid::now_v7()
    }

    /// Config for scheduler tests: fast ticks, in-memory storage.
    pub fn test_config() -> CourierConfig {
        CourierConfig::development()
    }

    /// Registration for `events` on the test URL with a known secret.
    pub fn webhook_config(events: &[&str]) -> WebhookConfig {
        WebhookConfig::new(TEST_URL)
            .with_events(events.iter().copied())
            .with_secret("whsec_fixture_secret")
    }

    /// A plausible event body.
    pub fn order_payload() -> Value {
        json!({
            "order_id": "ord_1001",
            "amount_cents": 4599,
            "currency": "USD",
        })
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for COURIER-specific error variants.

    use super::*;

    /// Assert that a CourierResult is a NotFound error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &CourierResult<T>) {
        match result {
            Err(CourierError::NotFound(_)) => {}
            other => panic!("Expected NotFound error, got: {:?}", other),
        }
    }

    /// Assert that a CourierResult is a Validation error.
    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &CourierResult<T>) {
        match result {
            Err(CourierError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OutboundRequest {
        OutboundRequest {
            url: fixtures::TEST_URL.to_string(),
            headers: Vec::new(),
            body: b"{}".to_vec(),
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_sequence_then_fallback() {
        let mock = MockTransport::sequence([500, 503]);
        assert!(mock.send(request()).await.is_err());
        assert!(matches!(
            mock.send(request()).await,
            Err(DeliveryError::HttpStatus { status: 503, .. })
        ));
        assert_eq!(
            mock.send(request()).await,
            Ok(TransportResponse { status: 200 })
        );
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_clones_share_recorded_requests() {
        let mock = MockTransport::unreachable();
        let handle = mock.clone();
        let _ = mock.send(request()).await;
        assert_eq!(handle.call_count(), 1);
        assert_eq!(
            handle.last_request().map(|r| r.url),
            Some(fixtures::TEST_URL.to_string())
        );
    }
}
