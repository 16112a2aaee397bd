//! Response bodies for the HTTP service

use serde::{Deserialize, Serialize};

/// Body returned for an accepted delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: String,

    /// Subscribers the event was dispatched to
    pub dispatched: usize,

    /// Subscribers whose filters ignored the event
    pub ignored: usize,
}

impl WebhookResponse {
    pub fn accepted(dispatched: usize, ignored: usize) -> Self {
        Self {
            status: "accepted".to_string(),
            dispatched,
            ignored,
        }
    }
}

/// Health check response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
