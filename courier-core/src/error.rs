//! Error types for COURIER operations

use crate::{DeliveryId, WebhookId};
use thiserror::Error;
use uuid::Uuid;

/// Kind of entity referenced by a [`NotFoundError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Webhook,
    Delivery,
}

/// Registration and update validation errors.
///
/// These are rejected synchronously and never reach the delivery queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid event pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Lookup of an unknown (or foreign-tenant) entity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?} not found: {id}")]
pub struct NotFoundError {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl NotFoundError {
    pub fn webhook(id: WebhookId) -> Self {
        Self {
            kind: EntityKind::Webhook,
            id,
        }
    }

    pub fn delivery(id: DeliveryId) -> Self {
        Self {
            kind: EntityKind::Delivery,
            id,
        }
    }
}

/// Outcome of a single failed delivery attempt.
///
/// All variants are retryable until the retry ceiling is reached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("HTTP {status}: {reason}")]
    HttpStatus { status: u16, reason: String },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Network error: {reason}")]
    Network { reason: String },
}

impl DeliveryError {
    /// HTTP status carried by the error, if the endpoint answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DeliveryError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Terminal failure: a delivery hit its retry ceiling.
///
/// Surfaced to observers as a signal. Never returned from `publish`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Delivery {delivery_id} to webhook {webhook_id} exhausted after {attempts} attempts: {last_error}")]
pub struct ExhaustionError {
    pub delivery_id: DeliveryId,
    pub webhook_id: WebhookId,
    pub attempts: u32,
    pub last_error: DeliveryError,
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to open store at {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all COURIER errors.
#[derive(Debug, Clone, Error)]
pub enum CourierError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Exhausted: {0}")]
    Exhausted(#[from] ExhaustionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Logging or metrics setup failed.
    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

impl CourierError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CourierError::NotFound(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, CourierError::Validation(_))
    }
}

/// Result type alias for COURIER operations.
pub type CourierResult<T> = Result<T, CourierError>;

// =============================================================================
// TESTS
// =============================================================================
