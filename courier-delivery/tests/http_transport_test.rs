//! Deliveries through the reqwest transport against a local axum receiver.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use courier_core::signature::verify;
use courier_core::{CourierConfig, PublishOptions, WebhookConfig};
use courier_delivery::{ReqwestTransport, WebhookService};
use courier_storage::InMemoryStore;
use courier_test_utils::fixtures::{order_payload, tenant, test_config};
use uuid::Uuid;

const SECRET: &str = "whsec_loopback_secret";

#[derive(Clone, Default)]
struct Received {
    calls: Arc<Mutex<Vec<(HeaderMap, Bytes)>>>,
}

impl Received {
    fn calls(&self) -> Vec<(HeaderMap, Bytes)> {
        self.calls.lock().unwrap().clone()
    }
}

async fn accept(State(received): State<Received>, headers: HeaderMap, body: Bytes) -> StatusCode {
    received.calls.lock().unwrap().push((headers, body));
    StatusCode::OK
}

async fn fail() -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn slow() -> StatusCode {
    tokio::time::sleep(Duration::from_secs(2)).await;
    StatusCode::OK
}

async fn moved() -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, "/hook")])
}

async fn start_receiver() -> (SocketAddr, Received) {
    let received = Received::default();
    let app = Router::new()
        .route("/hook", post(accept))
        .route("/fail", post(fail))
        .route("/slow", post(slow))
        .route("/moved", post(moved))
        .with_state(received.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, received)
}

async fn service() -> WebhookService {
    let config = test_config();
    let transport = ReqwestTransport::new(&config.user_agent).unwrap();
    WebhookService::open(config, Arc::new(InMemoryStore::new()), Arc::new(transport))
        .await
        .unwrap()
}

fn registration(url: String) -> WebhookConfig {
    WebhookConfig::new(url)
        .with_events(["order.*"])
        .with_secret(SECRET)
}

#[tokio::test]
async fn test_delivery_reaches_receiver_with_signed_headers() {
    let (addr, received) = start_receiver().await;
    let service = service().await;
    let t = tenant();
    let hook = service
        .register_webhook(
            t,
            registration(format!("http://{addr}/hook"))
                .with_header("X-Tenant", "acme")
                .with_header("X-Webhook-Signature", "forged"),
        )
        .await
        .unwrap();

    let receipt = service
        .publish_event(t, "order.created", order_payload(), PublishOptions::default())
        .await
        .unwrap();
    let report = service.process_due(Utc::now()).await.unwrap();
    assert_eq!(report.delivered, 1);

    let calls = received.calls();
    assert_eq!(calls.len(), 1);
    let (headers, body) = &calls[0];
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default();

    assert_eq!(get("content-type"), "application/json");
    assert_eq!(get("user-agent"), CourierConfig::default().user_agent);
    assert_eq!(get("x-webhook-event"), "order.created");
    assert!(Uuid::parse_str(get("x-webhook-delivery")).is_ok());
    let sent_at: i64 = get("x-webhook-timestamp").parse().unwrap();
    assert!((Utc::now().timestamp() - sent_at).abs() < 60);
    assert_eq!(get("x-tenant"), "acme");

    assert_eq!(headers.get_all("x-webhook-signature").iter().count(), 1);
    assert!(verify(SECRET, body, get("x-webhook-signature")));

    let payload: serde_json::Value = serde_json::from_slice(body).unwrap();
    assert_eq!(payload["id"], serde_json::json!(receipt.event_id));
    assert_eq!(payload["event"], "order.created");
    assert_eq!(payload["tenant_id"], serde_json::json!(t));
    assert_eq!(payload["data"]["order_id"], "ord_1001");

    let stats = service.webhook_stats(t, hook.id).await.unwrap();
    assert_eq!(stats.delivery_count, 1);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let (addr, _received) = start_receiver().await;
    let service = service().await;
    let t = tenant();
    service
        .register_webhook(t, registration(format!("http://{addr}/fail")))
        .await
        .unwrap();
    service
        .publish_event(t, "order.created", order_payload(), PublishOptions::default())
        .await
        .unwrap();
    let delivery_id = service.pending_deliveries(t).await.unwrap()[0].id;

    let report = service.process_due(Utc::now()).await.unwrap();
    assert_eq!(report.retried, 1);

    let attempts = service.delivery_attempts(t, delivery_id).await.unwrap();
    assert_eq!(attempts[0].status_code, Some(500));
    assert_eq!(service.pending_deliveries(t).await.unwrap()[0].attempts, 1);
}

#[tokio::test]
async fn test_slow_receiver_times_out() {
    let (addr, _received) = start_receiver().await;
    let service = service().await;
    let t = tenant();
    service
        .register_webhook(
            t,
            registration(format!("http://{addr}/slow")).with_timeout_ms(200),
        )
        .await
        .unwrap();
    service
        .publish_event(t, "order.created", order_payload(), PublishOptions::default())
        .await
        .unwrap();
    let delivery_id = service.pending_deliveries(t).await.unwrap()[0].id;

    service.process_due(Utc::now()).await.unwrap();

    let attempts = service.delivery_attempts(t, delivery_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(!attempts[0].success);
    assert_eq!(attempts[0].status_code, None);
    assert_eq!(
        attempts[0].error.as_deref(),
        Some("Request timed out after 200ms")
    );
}

#[tokio::test]
async fn test_redirects_are_not_followed() {
    let (addr, received) = start_receiver().await;
    let service = service().await;
    let t = tenant();
    service
        .register_webhook(t, registration(format!("http://{addr}/moved")))
        .await
        .unwrap();
    service
        .publish_event(t, "order.created", order_payload(), PublishOptions::default())
        .await
        .unwrap();
    let delivery_id = service.pending_deliveries(t).await.unwrap()[0].id;

    service.process_due(Utc::now()).await.unwrap();

    let attempts = service.delivery_attempts(t, delivery_id).await.unwrap();
    assert_eq!(attempts[0].status_code, Some(302));
    assert!(received.calls().is_empty());
}

#[tokio::test]
async fn test_unreachable_endpoint_is_a_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let service = service().await;
    let t = tenant();
    let hook = service
        .register_webhook(t, registration(format!("http://{addr}/hook")))
        .await
        .unwrap();

    let result = service.test_webhook(t, hook.id).await.unwrap();
    assert!(!result.success);
    assert_eq!(result.status_code, None);
    assert_eq!(result.response_time_ms, None);
    assert!(result.error.unwrap().starts_with("Network error"));
}

#[tokio::test]
async fn test_test_webhook_over_http() {
    let (addr, received) = start_receiver().await;
    let service = service().await;
    let t = tenant();
    let hook = service
        .register_webhook(t, registration(format!("http://{addr}/hook")))
        .await
        .unwrap();

    let result = service.test_webhook(t, hook.id).await.unwrap();
    assert!(result.success);
    assert_eq!(result.status_code, Some(200));
    assert!(result.response_time_ms.is_some());

    let calls = received.calls();
    assert_eq!(calls.len(), 1);
    let (headers, body) = &calls[0];
    assert_eq!(
        headers.get("x-webhook-event").and_then(|v| v.to_str().ok()),
        Some("webhook.test")
    );
    let payload: serde_json::Value = serde_json::from_slice(body).unwrap();
    assert_eq!(payload["data"]["webhook_id"], serde_json::json!(hook.id));
}
