//! Outbound HTTP delivery
//!
//! [`build_request`] turns a webhook and an event into the exact bytes and
//! headers sent on the wire. [`ReqwestTransport`] performs the call and
//! classifies the outcome. [`Dispatcher`] ties the two together and times
//! each attempt.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use courier_core::signature::sign;
use courier_core::{
    classify_status, new_entity_id, CourierError, CourierResult, DeliveryError, OutboundRequest,
    StorageError, Timestamp, Transport, TransportResponse, ValidationError, Webhook, WebhookEvent,
    WebhookPayload,
};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Client;
use uuid::Uuid;

pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_USER_AGENT: &str = "User-Agent";
pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";
pub const HEADER_EVENT: &str = "X-Webhook-Event";
pub const HEADER_DELIVERY: &str = "X-Webhook-Delivery";
pub const HEADER_TIMESTAMP: &str = "X-Webhook-Timestamp";

/// Custom headers with these names (case-insensitive) or the `X-Webhook-`
/// prefix are dropped so they cannot override the signed envelope.
pub fn is_reserved_header(name: &str) -> bool {
    name.eq_ignore_ascii_case(HEADER_CONTENT_TYPE)
        || name.eq_ignore_ascii_case(HEADER_USER_AGENT)
        || name
            .get(..10)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("x-webhook-"))
}

/// Reject custom headers reqwest could not send, and names repeated in a
/// different case.
pub fn validate_headers<'a, I>(headers: I) -> Result<(), ValidationError>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut seen = HashSet::new();
    for (name, value) in headers {
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(ValidationError::InvalidValue {
                field: format!("headers.{name}"),
                reason: "header name given more than once".to_string(),
            });
        }
        HeaderName::from_bytes(name.as_bytes()).map_err(|e| ValidationError::InvalidValue {
            field: format!("headers.{name}"),
            reason: e.to_string(),
        })?;
        HeaderValue::from_str(value).map_err(|e| ValidationError::InvalidValue {
            field: format!("headers.{name}"),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

/// Build one signed attempt.
///
/// `attempt_id` becomes `X-Webhook-Delivery`; it is fresh per attempt so
/// receivers can tell retries apart. The signature covers the exact body
/// bytes and uses the webhook's current secret.
pub fn build_request(
    webhook: &Webhook,
    event: &WebhookEvent,
    user_agent: &str,
    attempt_id: Uuid,
    at: Timestamp,
) -> CourierResult<OutboundRequest> {
    let body = serde_json::to_vec(&WebhookPayload::from(event)).map_err(|e| {
        CourierError::Storage(StorageError::Serialization {
            reason: e.to_string(),
        })
    })?;
    let signature = sign(&webhook.secret, &body)?;

    let mut headers = vec![
        (HEADER_CONTENT_TYPE.to_string(), "application/json".to_string()),
        (HEADER_USER_AGENT.to_string(), user_agent.to_string()),
        (HEADER_SIGNATURE.to_string(), signature),
        (HEADER_EVENT.to_string(), event.event_type.clone()),
        (HEADER_DELIVERY.to_string(), attempt_id.to_string()),
        (HEADER_TIMESTAMP.to_string(), at.timestamp().to_string()),
    ];
    headers.extend(
        webhook
            .headers
            .iter()
            .filter(|(name, _)| !is_reserved_header(name))
            .map(|(name, value)| (name.clone(), value.clone())),
    );

    Ok(OutboundRequest {
        url: webhook.url.clone(),
        headers,
        body,
        timeout: Duration::from_millis(webhook.timeout_ms),
    })
}

// ============================================================================
// REQWEST TRANSPORT
// ============================================================================

/// [`Transport`] over a shared reqwest client.
///
/// Redirects are not followed; a 3xx is a failed attempt like any other
/// non-2xx.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> CourierResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ValidationError::InvalidValue {
                field: "user_agent".to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, DeliveryError> {
        let timeout_ms = request.timeout.as_millis() as u64;
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                classify_status(status.as_u16(), status.canonical_reason())
            }
            Err(e) if e.is_timeout() => Err(DeliveryError::Timeout { timeout_ms }),
            Err(e) => Err(DeliveryError::Network {
                reason: e.to_string(),
            }),
        }
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Result of one timed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    /// Value of `X-Webhook-Delivery` for this attempt.
    pub attempt_id: Uuid,
    pub result: Result<TransportResponse, DeliveryError>,
    pub response_time_ms: u64,
    /// When the attempt resolved.
    pub completed_at: Timestamp,
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Builds, signs and sends attempts through a [`Transport`].
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    user_agent: String,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, user_agent: impl Into<String>) -> Self {
        Self {
            transport,
            user_agent: user_agent.into(),
        }
    }

    /// Perform one attempt. Never fails: a request that cannot be built is
    /// reported as a failed attempt.
    pub async fn dispatch(&self, webhook: &Webhook, event: &WebhookEvent) -> AttemptOutcome {
        let attempt_id = new_entity_id();
        let started = Instant::now();

        let result = match build_request(webhook, event, &self.user_agent, attempt_id, Utc::now()) {
            Ok(request) => self.transport.send(request).await,
            Err(e) => {
                tracing::error!(
                    webhook_id = %webhook.id,
                    event_id = %event.id,
                    error = %e,
                    "Failed to build webhook request"
                );
                Err(DeliveryError::Network {
                    reason: format!("request could not be built: {e}"),
                })
            }
        };

        AttemptOutcome {
            attempt_id,
            result,
            response_time_ms: started.elapsed().as_millis() as u64,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::signature::verify;
    use courier_core::{PublishOptions, RetryPolicy};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn webhook() -> Webhook {
        let now = Utc::now();
        Webhook {
            id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            url: "https://example.test/hook".to_string(),
            events: vec!["promotion.started".to_string()],
            secret: "whsec_transport".to_string(),
            previous_secret: None,
            active: true,
            headers: BTreeMap::from([
                ("X-Tenant".to_string(), "acme".to_string()),
                ("x-webhook-signature".to_string(), "forged".to_string()),
                ("content-type".to_string(), "text/plain".to_string()),
            ]),
            timeout_ms: 2_500,
            retry_policy: RetryPolicy::Exponential,
            delivery_count: 0,
            failure_count: 0,
            last_delivery: None,
            last_failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn event(tenant_id: Uuid) -> WebhookEvent {
        WebhookEvent::new(
            tenant_id,
            "promotion.started",
            json!({"promotion_id": "promo_1"}),
            &PublishOptions::default(),
            Utc::now(),
        )
    }

    #[test]
    fn test_build_request_headers_and_signature() {
        let hook = webhook();
        let event = event(hook.tenant_id);
        let attempt_id = Uuid::now_v7();
        let at = Utc::now();
        let request = build_request(&hook, &event, "Courier-Webhook/1.0", attempt_id, at).unwrap();

        assert_eq!(request.url, hook.url);
        assert_eq!(request.timeout, Duration::from_millis(2_500));
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("user-agent"), Some("Courier-Webhook/1.0"));
        assert_eq!(request.header(HEADER_EVENT), Some("promotion.started"));
        let attempt_header = attempt_id.to_string();
        assert_eq!(request.header(HEADER_DELIVERY), Some(attempt_header.as_str()));
        let ts = at.timestamp().to_string();
        assert_eq!(request.header(HEADER_TIMESTAMP), Some(ts.as_str()));
        assert_eq!(request.header("X-Tenant"), Some("acme"));

        let signature = request.header(HEADER_SIGNATURE).unwrap();
        assert!(verify(&hook.secret, &request.body, signature));
        let signature_count = request
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(HEADER_SIGNATURE))
            .count();
        assert_eq!(signature_count, 1);
    }

    #[test]
    fn test_body_is_canonical_payload() {
        let hook = webhook();
        let event = event(hook.tenant_id);
        let request = build_request(&hook, &event, "ua", Uuid::now_v7(), Utc::now()).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["id"], json!(event.id));
        assert_eq!(body["event"], "promotion.started");
        assert_eq!(body["data"]["promotion_id"], "promo_1");
        assert_eq!(body["tenant_id"], json!(hook.tenant_id));
    }

    #[test]
    fn test_reserved_headers() {
        assert!(is_reserved_header("Content-Type"));
        assert!(is_reserved_header("user-agent"));
        assert!(is_reserved_header("X-Webhook-Anything"));
        assert!(!is_reserved_header("X-Webhooks"));
        assert!(!is_reserved_header("Authorization"));
    }

    #[test]
    fn test_validate_headers() {
        let good = BTreeMap::from([("Authorization".to_string(), "Bearer t".to_string())]);
        assert!(validate_headers(&good).is_ok());
        let bad = BTreeMap::from([("bad header".to_string(), "v".to_string())]);
        assert!(validate_headers(&bad).is_err());
        let bad_value = BTreeMap::from([("X-Ok".to_string(), "line\nbreak".to_string())]);
        assert!(validate_headers(&bad_value).is_err());
    }

    #[test]
    fn test_validate_headers_rejects_case_duplicates() {
        let headers = BTreeMap::from([
            ("X-Tenant".to_string(), "acme".to_string()),
            ("x-tenant".to_string(), "other".to_string()),
        ]);
        let err = validate_headers(&headers).unwrap_err();
        assert!(err.to_string().contains("more than once"));

        let distinct = BTreeMap::from([
            ("X-Tenant".to_string(), "acme".to_string()),
            ("X-Region".to_string(), "eu".to_string()),
        ]);
        assert!(validate_headers(&distinct).is_ok());
    }
}
