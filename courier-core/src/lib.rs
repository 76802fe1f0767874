//! COURIER Core - Webhook Delivery Types
//!
//! Data types, error taxonomy and pure functions shared by every other
//! crate in the workspace: webhook/event/delivery records, the backoff
//! policy, event-type pattern matching, HMAC signing and configuration.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod backoff;
pub mod config;
pub mod entities;
pub mod error;
pub mod pattern;
pub mod signature;
pub mod transport;

pub use backoff::{delay, delay_ms};
pub use config::{CourierConfig, StorageBackend};
pub use entities::{
    success_rate, DeleteReceipt, Delivery, DeliveryAttempt, PublishOptions, PublishReceipt,
    RetiredSecret, RetryPolicy, SystemStats, TestResult, Webhook, WebhookConfig, WebhookEvent,
    WebhookPayload, WebhookStats, WebhookUpdate, WebhookView,
};
pub use error::{
    ConfigError, CourierError, CourierResult, DeliveryError, EntityKind, ExhaustionError,
    NotFoundError, StorageError, ValidationError,
};
pub use pattern::{is_glob, is_global, pattern_matches, GlobMatcher, GLOBAL_PATTERN};
pub use transport::{classify_status, OutboundRequest, Transport, TransportResponse};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

pub type WebhookId = EntityId;
pub type DeliveryId = EntityId;
pub type EventId = EntityId;
pub type TenantId = EntityId;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

// ============================================================================
// DEFAULTS
// ============================================================================

/// Per-call timeout for webhooks registered without one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Attempts after which a delivery is exhausted.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Concurrent deliveries per scheduler tick.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Scheduler tick period.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

/// Attempts kept per delivery.
pub const DEFAULT_ATTEMPT_HISTORY_LIMIT: usize = 10;

/// Attempt logs of finished deliveries kept for diagnostics.
pub const DEFAULT_FINISHED_LOG_RETENTION: usize = 1_000;

pub const DEFAULT_USER_AGENT: &str = "Courier-Webhook/1.0";

pub const DEFAULT_EVENT_SOURCE: &str = "courier";

pub const DEFAULT_EVENT_VERSION: &str = "1.0";

/// Event type synthesized by `test_webhook`.
pub const TEST_EVENT_TYPE: &str = "webhook.test";
