//! Outbound transport contract.
//!
//! Request/response types and the async trait the scheduler dispatches
//! through. The reqwest implementation lives in courier-delivery.

use crate::error::DeliveryError;
use async_trait::async_trait;
use std::time::Duration;

/// A fully built, signed outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub url: String,
    /// Header name/value pairs in send order. Names are unique
    /// case-insensitively.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

impl OutboundRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A 2xx acknowledgement from the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
}

/// Performs one outbound delivery call.
///
/// Implementations return `Ok` only for 2xx responses; every other outcome is
/// classified into a [`DeliveryError`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, DeliveryError>;
}

/// Classify a raw HTTP status into success or [`DeliveryError::HttpStatus`].
pub fn classify_status(status: u16, reason: Option<&str>) -> Result<TransportResponse, DeliveryError> {
    if (200..300).contains(&status) {
        Ok(TransportResponse { status })
    } else {
        Err(DeliveryError::HttpStatus {
            status,
            reason: reason.unwrap_or("Unknown Status").to_string(),
        })
    }
}
