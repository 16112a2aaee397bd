//! # Hook-Keeper Core
//!
//! Webhook lifecycle management and asynchronous completion reconciliation
//! shared by every third-party connector (CI providers, issue trackers,
//! incident tools).
//!
//! The crate is organised around four components:
//! - [`signature`]: verifies inbound payload authenticity against a shared secret
//! - [`subscription`]: shares one physical webhook registration between many
//!   logical subscribers scoped to the same external resource
//! - [`ingress`]: verifies, filters, normalizes and dispatches inbound deliveries
//! - [`completion`]: reconciles the terminal outcome of remote jobs from two
//!   racing signals (webhook push and scheduled poll)
//!
//! ## Architecture
//!
//! - Business logic depends only on trait abstractions ([`provider::ProviderAdapter`],
//!   [`provider::EventSink`], the keyed stores)
//! - Infrastructure implementations are injected at runtime
//! - All state is keyed by `(provider, scope)` or by execution; there are no globals
//!
//! ## Usage
//!
//! ```rust
//! use hook_keeper_core::{EventSet, ProviderId, Scope};
//!
//! let provider = ProviderId::new("circleci").unwrap();
//! let scope = Scope::new("gh/acme/widgets").unwrap();
//! let events = EventSet::from_iter(["workflow-completed"]);
//! assert!(events.contains("workflow-completed"));
//! # let _ = (provider, scope);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// Re-export commonly used types
pub use ulid::Ulid;
pub use uuid::Uuid;

// ============================================================================
// Domain Identifier Types
// ============================================================================

/// Identifier of a remote provider (`circleci`, `github`, `linear`, ...)
///
/// Provider IDs appear in webhook callback URLs, so they must be URL-safe:
/// lowercase ASCII letters, digits, hyphens and underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderId(String);

impl ProviderId {
    /// Create new provider ID with validation
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();

        if value.is_empty() {
            return Err(ValidationError::Required {
                field: "provider_id".to_string(),
            });
        }

        if value.len() > 64 {
            return Err(ValidationError::TooLong {
                field: "provider_id".to_string(),
                max_length: 64,
            });
        }

        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidCharacters {
                field: "provider_id".to_string(),
                invalid_chars: "use lowercase alphanumeric, hyphens, or underscores".to_string(),
            });
        }

        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProviderId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ProviderId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProviderId> for String {
    fn from(value: ProviderId) -> Self {
        value.0
    }
}

/// Provider-defined identity of the external resource a webhook is bound to
///
/// Examples: `gh/acme/widgets` (a CircleCI project slug), a Linear team ID,
/// `acme/widgets` (a GitHub repository). Together with the [`ProviderId`] it
/// decides whether two subscriptions may share a physical webhook.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Scope(String);

impl Scope {
    /// Create new scope with validation
    ///
    /// # Validation Rules
    /// - Must be 1-256 characters
    /// - Must not contain whitespace or control characters
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();

        if value.is_empty() {
            return Err(ValidationError::Required {
                field: "scope".to_string(),
            });
        }

        if value.len() > 256 {
            return Err(ValidationError::TooLong {
                field: "scope".to_string(),
                max_length: 256,
            });
        }

        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ValidationError::InvalidCharacters {
                field: "scope".to_string(),
                invalid_chars: "whitespace or control characters".to_string(),
            });
        }

        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Scope {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Scope {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Scope> for String {
    fn from(value: Scope) -> Self {
        value.0
    }
}

/// Declares an opaque, non-empty string identifier.
macro_rules! opaque_identifier {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Create new identifier; the value must not be empty
            pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(ValidationError::Required {
                        field: $field.to_string(),
                    });
                }
                Ok(Self(value))
            }

            /// Get string representation
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

opaque_identifier!(
    /// Opaque identity of one internal consumer (a node, trigger or component instance)
    SubscriberId,
    "subscriber_id"
);

opaque_identifier!(
    /// Handle to the internal execution that owns a remote job's outcome
    ExecutionRef,
    "execution_ref"
);

opaque_identifier!(
    /// Provider-assigned identifier of a remote job (pipeline ID, build number, ...)
    ExternalJobKey,
    "external_job_key"
);

opaque_identifier!(
    /// Identifier of one provider-side unit of work inside a remote job
    SubJobId,
    "sub_job_id"
);

opaque_identifier!(
    /// Provider-assigned identifier of a physical webhook registration
    ExternalWebhookId,
    "external_webhook_id"
);

impl ExecutionRef {
    /// Generate a fresh random execution reference
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Internal routing token for a physical webhook
///
/// Embedded in the callback URL handed to the provider, so inbound
/// deliveries can be matched to the registration without trusting any
/// provider-supplied field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WebhookId(Ulid);

impl WebhookId {
    /// Generate a new unique webhook ID
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get string representation of webhook ID
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for WebhookId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WebhookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WebhookId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ulid = s.parse::<Ulid>().map_err(|_| ParseError::InvalidFormat {
            expected: "ULID format".to_string(),
            actual: s.to_string(),
        })?;
        Ok(Self(ulid))
    }
}

/// Unique identifier for normalized events
///
/// Uses ULID for lexicographic sorting and global uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(Ulid);

impl EventId {
    /// Generate a new unique event ID
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get string representation of event ID
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Event Sets
// ============================================================================

/// Ordered set of provider event-type strings
///
/// Ordering is stable so that registrations sent to providers and persisted
/// records are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventSet(BTreeSet<String>);

impl EventSet {
    /// Create an empty event set
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Check whether the set contains an event type
    pub fn contains(&self, event_type: &str) -> bool {
        self.0.contains(event_type)
    }

    /// Add an event type, returning `true` when it was not present
    pub fn insert(&mut self, event_type: impl Into<String>) -> bool {
        self.0.insert(event_type.into())
    }

    /// True when every event in `other` is also in `self`
    pub fn is_superset_of(&self, other: &EventSet) -> bool {
        self.0.is_superset(&other.0)
    }

    /// Union of both sets
    pub fn union(&self, other: &EventSet) -> EventSet {
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// Events in `other` that are missing from `self`
    pub fn missing_from(&self, other: &EventSet) -> EventSet {
        Self(other.0.difference(&self.0).cloned().collect())
    }

    /// Number of event types
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over event types in order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for EventSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "{{{}}}", joined.join(", "))
    }
}

// ============================================================================
// Time and Metadata Types
// ============================================================================

/// UTC timestamp with microsecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current moment
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Subtract duration from timestamp
    pub fn subtract_duration(&self, duration: Duration) -> Self {
        let chrono_duration = chrono::Duration::from_std(duration).unwrap_or_default();
        Self(self.0 - chrono_duration)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// High-level error categorization for retry and alerting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Temporary failures that should be retried
    Transient,
    /// Permanent failures that won't succeed on retry
    Permanent,
    /// Security-related failures requiring immediate attention
    Security,
    /// Configuration errors preventing startup
    Configuration,
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
}

impl RetryPolicy {
    /// Create exponential backoff retry policy
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }

    /// Create fixed delay retry policy
    pub fn fixed(delay: Duration) -> Self {
        Self {
            max_attempts: 5,
            base_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter_enabled: false,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_enabled: false,
        }
    }

    /// Calculate delay for specific attempt number
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let mut delay = self.base_delay.as_millis() as f64;

        for _ in 1..attempt {
            delay *= self.backoff_multiplier;
        }

        if self.jitter_enabled {
            use std::collections::hash_map::DefaultHasher;
            use std::hash::{Hash, Hasher};

            let mut hasher = DefaultHasher::new();
            attempt.hash(&mut hasher);
            let hash = hasher.finish();

            // ±25% jitter
            let jitter_factor = 0.75 + (hash % 500) as f64 / 1000.0;
            delay *= jitter_factor;
        }

        let delay_ms = delay.min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

/// Error type for input validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' has invalid format: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    TooLong { field: String, max_length: usize },

    #[error("Field '{field}' contains invalid characters: {invalid_chars}")]
    InvalidCharacters {
        field: String,
        invalid_chars: String,
    },
}

/// Errors surfaced by the keyed stores backing subscriptions and correlations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Storage I/O failed: {message}")]
    Io { message: String },

    #[error("Stored record could not be (de)serialized: {message}")]
    Serialization { message: String },
}

impl StoreError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Serialization { .. } => false,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

/// Error type for string parsing failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid format: expected {expected}, got '{actual}'")]
    InvalidFormat { expected: String, actual: String },
}

// ============================================================================
// Module declarations
// ============================================================================

/// Shared webhook secrets
pub mod secret;

/// Capabilities consumed from provider adapters and the event sink
pub mod provider;

/// Inbound payload signature verification
pub mod signature;

/// Physical webhook sharing across logical subscribers
pub mod subscription;

/// Inbound webhook verification, filtering and dispatch
pub mod ingress;

/// Terminal-outcome reconciliation for long-running remote jobs
pub mod completion;

/// Keyed store implementations
pub mod adapters;

// Re-export key types for convenience
pub use completion::{
    CompletionConfig, CompletionError, CompletionOutcome, CompletionReconciler, CorrelationStore,
    DispatchRequest, JobCompletionState, JobCorrelation, JobStatus, Reconciliation,
};
pub use ingress::{
    DeliveryReport, IngressError, IngressOutcome, IngressPipeline, IngressRegistry, IngressRouter,
    IngressSubscription, NormalizedEvent, ProviderProfile, SecretResolver,
};
pub use provider::{EventSink, ProviderAdapter, ProviderError, ProviderRegistry, SinkError};
pub use secret::WebhookSecret;
pub use signature::{SignatureError, SignatureScheme};
pub use subscription::{
    AttachRequest, DetachOutcome, PhysicalWebhook, SubscriptionConfig, SubscriptionError,
    SubscriptionReconciler, SubscriptionStore,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
