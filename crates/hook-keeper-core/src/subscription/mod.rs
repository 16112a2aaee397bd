//! # Subscription Reconciler
//!
//! Shares one physical webhook registration per `(provider, scope)` between
//! any number of logical subscribers.
//!
//! - The first attach for a scope creates the registration.
//! - Later attaches reuse it when the provider's [`MergePolicy`] says it is
//!   equivalent, otherwise the registration is updated with the merged config.
//! - Detach never shrinks the effective event set; the registration is
//!   deleted only when the last subscriber leaves.
//!
//! All operations on one `(provider, scope)` are serialized. Provider calls
//! happen before any local write, so a failed call leaves the store unchanged.

use crate::provider::{ProviderRegistry, WebhookRegistration};
use crate::{
    ErrorCategory, EventSet, ExternalWebhookId, ProviderError, ProviderId, Scope, StoreError,
    SubscriberId, Timestamp, WebhookId, WebhookSecret,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub mod locks;
pub mod policy;

pub use locks::KeyedLocks;
pub use policy::{
    ExactEventsPolicy, MergePolicy, PolicyKind, PolicyRegistry, ScopeKeyPolicy, SupersetPolicy,
    WebhookConfig,
};

// ============================================================================
// Records
// ============================================================================

/// The single externally registered webhook backing one or more subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalWebhook {
    /// Internal routing token embedded in the callback URL
    pub webhook_id: WebhookId,
    pub provider: ProviderId,
    pub scope: Scope,
    pub external_id: ExternalWebhookId,
    pub url: String,

    /// Union of every attached subscriber's desired events, never shrunk
    pub effective_events: EventSet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_key: Option<String>,

    pub secret: WebhookSecret,

    /// Attached subscribers and the events each asked for
    pub subscribers: BTreeMap<SubscriberId, EventSet>,

    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl PhysicalWebhook {
    /// Registration config as compared by merge policies
    pub fn config(&self) -> WebhookConfig {
        WebhookConfig {
            scope: self.scope.clone(),
            events: self.effective_events.clone(),
            secondary_key: self.secondary_key.clone(),
        }
    }

    /// Check whether a subscriber is attached
    pub fn is_attached(&self, subscriber: &SubscriberId) -> bool {
        self.subscribers.contains_key(subscriber)
    }

    /// IDs of all attached subscribers
    pub fn attached_subscribers(&self) -> Vec<SubscriberId> {
        self.subscribers.keys().cloned().collect()
    }
}

/// Keyed, durable storage for physical webhooks
///
/// Records are addressable both by `(provider, scope)` and by [`WebhookId`].
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Webhook registered for `(provider, scope)`, if any
    async fn get(
        &self,
        provider: &ProviderId,
        scope: &Scope,
    ) -> Result<Option<PhysicalWebhook>, StoreError>;

    /// Webhook with the given routing token, if any
    async fn get_by_id(&self, webhook_id: &WebhookId)
        -> Result<Option<PhysicalWebhook>, StoreError>;

    /// Insert or replace a webhook record
    async fn put(&self, webhook: &PhysicalWebhook) -> Result<(), StoreError>;

    /// Remove a webhook record; removing a missing record is not an error
    async fn remove(&self, webhook_id: &WebhookId) -> Result<(), StoreError>;

    /// Every stored webhook
    async fn list(&self) -> Result<Vec<PhysicalWebhook>, StoreError>;
}

// ============================================================================
// Requests and outcomes
// ============================================================================

/// Settings shared by all subscriptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Public base URL providers call back to, e.g. `https://hooks.example.com/webhooks`
    pub callback_base_url: String,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            callback_base_url: "http://localhost:8080/webhooks".to_string(),
        }
    }
}

impl SubscriptionConfig {
    /// Callback URL for one physical webhook: `{base}/{provider}/{webhook_id}`
    pub fn callback_url(&self, provider: &ProviderId, webhook_id: &WebhookId) -> String {
        format!(
            "{}/{}/{}",
            self.callback_base_url.trim_end_matches('/'),
            provider,
            webhook_id
        )
    }
}

/// One subscriber's request for notifications about a scope
#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub provider: ProviderId,
    pub scope: Scope,
    pub subscriber: SubscriberId,
    pub events: EventSet,

    /// Secret the subscriber requires; generated when absent
    pub secret_hint: Option<WebhookSecret>,

    pub secondary_key: Option<String>,
}

impl AttachRequest {
    /// Create a request without secret hint or secondary key
    pub fn new(provider: ProviderId, scope: Scope, subscriber: SubscriberId, events: EventSet) -> Self {
        Self {
            provider,
            scope,
            subscriber,
            events,
            secret_hint: None,
            secondary_key: None,
        }
    }

    /// Require a specific secret
    pub fn with_secret(mut self, secret: WebhookSecret) -> Self {
        self.secret_hint = Some(secret);
        self
    }

    /// Set the provider-specific secondary key
    pub fn with_secondary_key(mut self, key: impl Into<String>) -> Self {
        self.secondary_key = Some(key.into());
        self
    }

    fn config(&self) -> WebhookConfig {
        WebhookConfig {
            scope: self.scope.clone(),
            events: self.events.clone(),
            secondary_key: self.secondary_key.clone(),
        }
    }
}

/// Result of detaching a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The subscriber was not attached; nothing changed
    NotAttached,

    /// Other subscribers remain; the registration is untouched
    Retained { remaining: usize },

    /// The last subscriber left and the registration was deleted
    Deleted { external_id: ExternalWebhookId },

    /// The last subscriber left but the provider delete failed
    ///
    /// The local record is gone; the caller should schedule cleanup of
    /// `external_id`.
    Orphaned {
        external_id: ExternalWebhookId,
        error: String,
    },
}

/// Errors surfaced by the subscription reconciler
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("No adapter registered for provider '{provider}'")]
    UnknownProvider { provider: ProviderId },

    #[error("Incompatible webhook configuration: {reason}")]
    SubscriptionConflict { reason: String },

    #[error("Provider call failed: {0}")]
    ProviderUnavailable(#[from] ProviderError),

    #[error("Subscription store failed: {0}")]
    Store(#[from] StoreError),
}

impl SubscriptionError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::UnknownProvider { .. } => false,
            Self::SubscriptionConflict { .. } => false,
            Self::ProviderUnavailable(e) => e.is_transient(),
            Self::Store(e) => e.is_transient(),
        }
    }

    /// Get error category for monitoring
    pub fn error_category(&self) -> ErrorCategory {
        match self {
            Self::UnknownProvider { .. } => ErrorCategory::Configuration,
            Self::SubscriptionConflict { .. } => ErrorCategory::Permanent,
            Self::ProviderUnavailable(e) => e.error_category(),
            Self::Store(e) if e.is_transient() => ErrorCategory::Transient,
            Self::Store(_) => ErrorCategory::Permanent,
        }
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Shares physical webhooks between logical subscribers
pub struct SubscriptionReconciler {
    config: SubscriptionConfig,
    providers: Arc<ProviderRegistry>,
    policies: PolicyRegistry,
    store: Arc<dyn SubscriptionStore>,
    locks: KeyedLocks<(ProviderId, Scope)>,
}

impl SubscriptionReconciler {
    /// Create a reconciler using the superset policy for every provider
    pub fn new(
        config: SubscriptionConfig,
        providers: Arc<ProviderRegistry>,
        store: Arc<dyn SubscriptionStore>,
    ) -> Self {
        Self {
            config,
            providers,
            policies: PolicyRegistry::new(),
            store,
            locks: KeyedLocks::new(),
        }
    }

    /// Replace the per-provider merge policies
    pub fn with_policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    /// Attach a subscriber, creating or widening the shared registration
    ///
    /// Returns the webhook whose secret verifies inbound deliveries for this
    /// subscriber. Re-attaching an attached subscriber is idempotent; new
    /// events in the request are merged.
    ///
    /// # Errors
    ///
    /// - [`SubscriptionError::UnknownProvider`] for an unregistered provider
    /// - [`SubscriptionError::SubscriptionConflict`] when the secret hint or
    ///   policy rules rule out sharing
    /// - [`SubscriptionError::ProviderUnavailable`] when the create or update
    ///   call fails; nothing is stored in that case
    #[instrument(skip_all, fields(provider = %request.provider, scope = %request.scope, subscriber = %request.subscriber))]
    pub async fn attach(&self, request: AttachRequest) -> Result<PhysicalWebhook, SubscriptionError> {
        let adapter = self
            .providers
            .get(&request.provider)
            .ok_or_else(|| SubscriptionError::UnknownProvider {
                provider: request.provider.clone(),
            })?;
        let policy = self.policies.policy_for(&request.provider);

        let _guard = self
            .locks
            .acquire(&(request.provider.clone(), request.scope.clone()))
            .await;

        let Some(mut webhook) = self.store.get(&request.provider, &request.scope).await? else {
            return self.create(adapter.as_ref(), request).await;
        };

        if let Some(hint) = &request.secret_hint {
            if !hint.matches(&webhook.secret) {
                return Err(SubscriptionError::SubscriptionConflict {
                    reason: format!(
                        "subscriber '{}' requires a different secret than the registered webhook",
                        request.subscriber
                    ),
                });
            }
        }

        let current = webhook.config();
        let requested = request.config();

        if policy.equivalent(&current, &requested) {
            debug!(
                webhook_id = %webhook.webhook_id,
                policy = policy.name(),
                "Existing webhook already covers requested events"
            );
        } else {
            let merged = policy.merge(&current, &requested)?;
            let registration = WebhookRegistration {
                scope: webhook.scope.clone(),
                url: webhook.url.clone(),
                secret: webhook.secret.clone(),
                events: merged.events.clone(),
                existing: Some(webhook.external_id.clone()),
            };

            let external_id = adapter.create_or_update_webhook(&registration).await?;

            info!(
                webhook_id = %webhook.webhook_id,
                added = %current.events.missing_from(&merged.events),
                effective_events = %merged.events,
                "Updated physical webhook with merged events"
            );

            webhook.external_id = external_id;
            webhook.effective_events = merged.events;
            webhook.secondary_key = merged.secondary_key;
        }

        let desired = webhook
            .subscribers
            .get(&request.subscriber)
            .map(|existing| existing.union(&request.events))
            .unwrap_or_else(|| request.events.clone());
        webhook.subscribers.insert(request.subscriber.clone(), desired);
        webhook.updated_at = Timestamp::now();

        self.store.put(&webhook).await?;

        info!(
            webhook_id = %webhook.webhook_id,
            subscribers = webhook.subscribers.len(),
            "Subscriber attached"
        );

        Ok(webhook)
    }

    async fn create(
        &self,
        adapter: &dyn crate::ProviderAdapter,
        request: AttachRequest,
    ) -> Result<PhysicalWebhook, SubscriptionError> {
        let webhook_id = WebhookId::new();
        let url = self.config.callback_url(&request.provider, &webhook_id);
        let secret = request
            .secret_hint
            .clone()
            .unwrap_or_else(WebhookSecret::generate);

        let registration = WebhookRegistration {
            scope: request.scope.clone(),
            url: url.clone(),
            secret: secret.clone(),
            events: request.events.clone(),
            existing: None,
        };

        let external_id = adapter.create_or_update_webhook(&registration).await?;

        let now = Timestamp::now();
        let mut subscribers = BTreeMap::new();
        subscribers.insert(request.subscriber.clone(), request.events.clone());

        let webhook = PhysicalWebhook {
            webhook_id,
            provider: request.provider,
            scope: request.scope,
            external_id,
            url,
            effective_events: request.events,
            secondary_key: request.secondary_key,
            secret,
            subscribers,
            created_at: now,
            updated_at: now,
        };

        if let Err(store_error) = self.store.put(&webhook).await {
            // Roll back the registration so no unrecorded webhook remains.
            if let Err(delete_error) = adapter.delete_webhook(&webhook.external_id).await {
                warn!(
                    external_id = %webhook.external_id,
                    error = %delete_error,
                    "Failed to roll back webhook after store failure"
                );
            }
            return Err(store_error.into());
        }

        info!(
            webhook_id = %webhook.webhook_id,
            external_id = %webhook.external_id,
            events = %webhook.effective_events,
            "Created physical webhook"
        );

        Ok(webhook)
    }

    /// Detach a subscriber, deleting the registration when it was the last one
    ///
    /// # Errors
    ///
    /// Store failures and an unregistered provider are surfaced. A failed
    /// provider delete is not an error; see [`DetachOutcome::Orphaned`].
    #[instrument(skip_all, fields(provider = %provider, scope = %scope, subscriber = %subscriber))]
    pub async fn detach(
        &self,
        provider: &ProviderId,
        scope: &Scope,
        subscriber: &SubscriberId,
    ) -> Result<DetachOutcome, SubscriptionError> {
        let _guard = self.locks.acquire(&(provider.clone(), scope.clone())).await;

        let Some(mut webhook) = self.store.get(provider, scope).await? else {
            return Ok(DetachOutcome::NotAttached);
        };

        if !webhook.is_attached(subscriber) {
            return Ok(DetachOutcome::NotAttached);
        }

        if webhook.subscribers.len() > 1 {
            webhook.subscribers.remove(subscriber);
            webhook.updated_at = Timestamp::now();
            self.store.put(&webhook).await?;

            info!(
                webhook_id = %webhook.webhook_id,
                remaining = webhook.subscribers.len(),
                "Subscriber detached, webhook retained"
            );
            return Ok(DetachOutcome::Retained {
                remaining: webhook.subscribers.len(),
            });
        }

        let adapter = self
            .providers
            .get(provider)
            .ok_or_else(|| SubscriptionError::UnknownProvider {
                provider: provider.clone(),
            })?;

        let external_id = webhook.external_id.clone();
        let outcome = match adapter.delete_webhook(&external_id).await {
            Ok(()) => DetachOutcome::Deleted {
                external_id: external_id.clone(),
            },
            Err(ProviderError::NotFound { .. }) => {
                debug!(external_id = %external_id, "Webhook already gone at provider");
                DetachOutcome::Deleted {
                    external_id: external_id.clone(),
                }
            }
            Err(e) => {
                warn!(
                    external_id = %external_id,
                    error = %e,
                    "Failed to delete physical webhook; leaving it orphaned"
                );
                DetachOutcome::Orphaned {
                    external_id: external_id.clone(),
                    error: e.to_string(),
                }
            }
        };

        self.store.remove(&webhook.webhook_id).await?;

        info!(
            webhook_id = %webhook.webhook_id,
            external_id = %external_id,
            "Last subscriber detached, webhook released"
        );

        Ok(outcome)
    }

    /// Whether `existing` serves `requested` under the provider's policy
    pub fn equivalent(
        &self,
        provider: &ProviderId,
        existing: &WebhookConfig,
        requested: &WebhookConfig,
    ) -> bool {
        self.policies
            .policy_for(provider)
            .equivalent(existing, requested)
    }

    /// Webhook behind a routing token
    pub async fn lookup(
        &self,
        webhook_id: &WebhookId,
    ) -> Result<Option<PhysicalWebhook>, SubscriptionError> {
        Ok(self.store.get_by_id(webhook_id).await?)
    }

    /// Verification secret for a routing token
    pub async fn secret_for(
        &self,
        webhook_id: &WebhookId,
    ) -> Result<Option<WebhookSecret>, SubscriptionError> {
        Ok(self
            .store
            .get_by_id(webhook_id)
            .await?
            .map(|webhook| webhook.secret))
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
