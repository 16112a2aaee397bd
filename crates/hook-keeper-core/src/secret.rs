//! # Webhook Secrets
//!
//! Shared signing secrets for physical webhook registrations.

use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Shared signing secret for one physical webhook
///
/// The bytes are wiped when the value is dropped and never appear in
/// `Debug` output. Serialization is needed because the secret is persisted
/// alongside the webhook record so verification survives restarts.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct WebhookSecret {
    inner: Vec<u8>,
}

impl WebhookSecret {
    /// Create secret from raw bytes
    pub fn from_bytes(value: Vec<u8>) -> Self {
        Self { inner: value }
    }

    /// Create secret from a string
    pub fn from_string(value: String) -> Self {
        Self {
            inner: value.into_bytes(),
        }
    }

    /// Generate a fresh random secret (32 random bytes, hex-encoded)
    pub fn generate() -> Self {
        let mut raw: [u8; 32] = rand::random();
        let encoded = hex::encode(raw);
        raw.zeroize();
        Self::from_string(encoded)
    }

    /// Get secret bytes (only for immediate use)
    pub fn expose_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Check if secret is empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Get secret length without exposing content
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Constant-time equality against another secret
    pub fn matches(&self, other: &WebhookSecret) -> bool {
        self.inner.ct_eq(&other.inner).into()
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookSecret")
            .field("length", &self.len())
            .field("value", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for WebhookSecret {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl Eq for WebhookSecret {}

#[cfg(test)]
#[path = "secret_tests.rs"]
mod tests;
