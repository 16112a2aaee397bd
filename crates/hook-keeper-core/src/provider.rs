//! # Provider and Sink Capabilities
//!
//! Narrow capability interfaces consumed by the core. Concrete HTTP/GraphQL
//! clients for each remote system implement [`ProviderAdapter`]; the workflow
//! engine implements [`EventSink`].

use crate::{
    EventSet, ExternalJobKey, ExternalWebhookId, ProviderId, Scope, SubJobId, WebhookSecret,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Provider Adapter
// ============================================================================

/// Desired state of a physical webhook registration
///
/// When `existing` is set the adapter must update that registration in
/// place instead of creating a new one.
#[derive(Debug, Clone)]
pub struct WebhookRegistration {
    pub scope: Scope,
    pub url: String,
    pub secret: WebhookSecret,
    pub events: EventSet,
    pub existing: Option<ExternalWebhookId>,
}

impl WebhookRegistration {
    /// True when this registration updates an existing webhook
    pub fn is_update(&self) -> bool {
        self.existing.is_some()
    }
}

/// Authoritative status of one remote sub-job as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubJobStatus {
    pub sub_job_id: SubJobId,
    /// Provider vocabulary (e.g. `running`, `on_hold`, `success`)
    pub raw_status: String,
}

impl SubJobStatus {
    /// Create new sub-job status
    pub fn new(sub_job_id: SubJobId, raw_status: impl Into<String>) -> Self {
        Self {
            sub_job_id,
            raw_status: raw_status.into(),
        }
    }
}

/// Provider response to a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Cancellation accepted; completion will be signalled later
    Requested,
    /// The provider confirmed the job is cancelled
    Confirmed,
}

/// Remote provider capability set
///
/// Implementations own their transport concerns: authentication, request
/// timeouts and retry policy.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider this adapter talks to
    fn provider_id(&self) -> &ProviderId;

    /// Create a webhook, or update `registration.existing` in place
    async fn create_or_update_webhook(
        &self,
        registration: &WebhookRegistration,
    ) -> Result<ExternalWebhookId, ProviderError>;

    /// Delete a physical webhook registration
    async fn delete_webhook(&self, external_id: &ExternalWebhookId) -> Result<(), ProviderError>;

    /// Fetch authoritative status for every sub-job of a remote job
    ///
    /// `known_sub_jobs` lists sub-jobs already tracked locally; adapters
    /// return the complete current set, which may include sub-jobs the core
    /// has not seen yet.
    async fn fetch_job_status(
        &self,
        job_key: &ExternalJobKey,
        known_sub_jobs: &[SubJobId],
    ) -> Result<Vec<SubJobStatus>, ProviderError>;

    /// Ask the provider to cancel a remote job
    async fn cancel_job(&self, job_key: &ExternalJobKey) -> Result<CancelOutcome, ProviderError>;
}

/// Errors surfaced by provider adapters
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider unavailable: {message}")]
    Unavailable { message: String },

    #[error("Provider rejected request: {message}")]
    Rejected { message: String },

    #[error("Remote resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Provider authentication failed: {message}")]
    Unauthorized { message: String },
}

impl ProviderError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable { .. } => true,
            Self::Rejected { .. } => false,
            Self::NotFound { .. } => false,
            Self::Unauthorized { .. } => false,
        }
    }

    /// Get error category for monitoring
    pub fn error_category(&self) -> crate::ErrorCategory {
        match self {
            Self::Unavailable { .. } => crate::ErrorCategory::Transient,
            Self::Rejected { .. } => crate::ErrorCategory::Permanent,
            Self::NotFound { .. } => crate::ErrorCategory::Permanent,
            Self::Unauthorized { .. } => crate::ErrorCategory::Configuration,
        }
    }
}

/// Provider adapters indexed by the provider they talk to
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own provider ID, replacing any previous one
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider_id().clone(), adapter);
    }

    /// Builder-style registration
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Adapter for `provider`, if registered
    pub fn get(&self, provider: &ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).cloned()
    }

    /// IDs of every registered provider
    pub fn providers(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

// ============================================================================
// Event Sink
// ============================================================================

/// Ingestion point of the workflow engine
///
/// Callers guarantee at most one call per terminal transition; the sink
/// itself is not required to deduplicate.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emit an event on an output channel
    async fn emit(
        &self,
        channel: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), SinkError>;
}

/// Errors surfaced by event sinks
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("Event sink unavailable: {message}")]
    Unavailable { message: String },

    #[error("Event rejected by sink: {message}")]
    Rejected { message: String },
}

impl SinkError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
