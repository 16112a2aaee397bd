//! # Ingress Pipeline
//!
//! Turns one raw inbound delivery into at most one normalized event per
//! subscriber. Each step may end processing:
//!
//! 1. Resolve the event type; a resource kind the subscriber does not track
//!    is ignored (200)
//! 2. Verify the signature; missing or invalid signatures are rejected (403)
//! 3. Parse the JSON payload; malformed payloads are rejected (400)
//! 4. Skip deliveries already dispatched to this subscriber (200)
//! 5. Apply the subscriber's event filter; non-matching events are ignored (200)
//! 6. Emit the normalized event to the subscriber's channel
//!
//! Providers redeliver the whole request when any subscriber fails. The
//! pipeline remembers recent `(delivery, subscriber)` pairs in memory so a
//! redelivery only reaches the subscribers that missed it.

use crate::signature::{self, SignatureError, SignatureScheme};
use crate::subscription::SubscriptionReconciler;
use crate::{
    ErrorCategory, EventId, EventSink, ProviderId, Scope, SinkError, SubscriberId, Timestamp,
    WebhookId, WebhookSecret,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

pub mod filter;

pub use filter::{resolve_json_path, resolve_json_string, ContentFilter, EventFilter, FieldSource};

// ============================================================================
// Provider profiles and subscriptions
// ============================================================================

/// How a provider shapes its deliveries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub provider: ProviderId,

    /// Where the event type is read from
    pub event_type: FieldSource,

    /// Where the action (create/update/remove, ...) is read from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<FieldSource>,

    pub signature: SignatureScheme,

    /// Where the provider's per-delivery ID is read from, if it sends one
    ///
    /// Redeliveries repeat the ID; without it every delivery is new.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<FieldSource>,

    /// Resource kind per event-type prefix (e.g. `workflow-` → `workflow`)
    ///
    /// Event types without a matching prefix are their own resource kind.
    #[serde(default)]
    pub resource_kinds: BTreeMap<String, String>,
}

impl ProviderProfile {
    /// Resource kind for an event type, using the longest matching prefix
    pub fn resource_kind_for(&self, event_type: &str) -> String {
        self.resource_kinds
            .iter()
            .filter(|(prefix, _)| event_type.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, kind)| kind.clone())
            .unwrap_or_else(|| event_type.to_string())
    }

    /// CircleCI: `Circleci-Event-Type` header and `v1=` signatures
    pub fn circleci() -> Self {
        let mut resource_kinds = BTreeMap::new();
        resource_kinds.insert("workflow-".to_string(), "workflow".to_string());
        resource_kinds.insert("job-".to_string(), "job".to_string());

        Self {
            provider: ProviderId("circleci".to_string()),
            event_type: FieldSource::Header {
                name: "Circleci-Event-Type".to_string(),
            },
            action: None,
            signature: SignatureScheme::circleci(),
            delivery_id: Some(FieldSource::JsonPath {
                path: "id".to_string(),
            }),
            resource_kinds,
        }
    }

    /// Linear: type and action in the body, bare hex signatures
    pub fn linear() -> Self {
        Self {
            provider: ProviderId("linear".to_string()),
            event_type: FieldSource::JsonPath {
                path: "type".to_string(),
            },
            action: Some(FieldSource::JsonPath {
                path: "action".to_string(),
            }),
            signature: SignatureScheme::linear(),
            delivery_id: Some(FieldSource::Header {
                name: "Linear-Delivery".to_string(),
            }),
            resource_kinds: BTreeMap::new(),
        }
    }
}

/// One subscriber's interest in deliveries to a physical webhook
#[derive(Debug, Clone)]
pub struct IngressSubscription {
    pub subscriber_id: SubscriberId,
    pub webhook_id: WebhookId,
    pub scope: Scope,
    pub profile: Arc<ProviderProfile>,
    pub filter: EventFilter,

    /// Sink channel events are emitted on
    pub channel: String,

    /// Resource kinds this subscriber tracks; empty tracks all
    pub resource_kinds: crate::EventSet,
}

impl IngressSubscription {
    pub fn provider(&self) -> &ProviderId {
        &self.profile.provider
    }
}

/// Provider-independent form of an accepted delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event_id: EventId,
    pub provider: ProviderId,
    pub scope: Scope,
    pub webhook_id: WebhookId,
    pub subscriber_id: SubscriberId,
    pub event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    pub received_at: Timestamp,
    pub payload: serde_json::Value,
}

// ============================================================================
// Outcomes and errors
// ============================================================================

/// Result of processing a delivery for one subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    /// The normalized event was emitted
    Dispatched { event_id: EventId },

    /// Deliberately not dispatched; not an error
    Ignored { reason: String },
}

/// Errors surfaced by the ingress pipeline
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("Signature verification failed: {0}")]
    Signature(#[from] SignatureError),

    #[error("Malformed payload: {message}")]
    MalformedPayload { message: String },

    #[error("No subscription for webhook '{webhook_id}'")]
    UnknownWebhook { webhook_id: String },

    #[error("Secret lookup failed: {message}")]
    SecretLookup { message: String },

    #[error("Event dispatch failed: {0}")]
    Dispatch(#[from] SinkError),
}

impl IngressError {
    /// HTTP status this error should produce
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Signature(SignatureError::SecretUnavailable) => 500,
            Self::Signature(_) => 403,
            Self::MalformedPayload { .. } => 400,
            Self::UnknownWebhook { .. } => 404,
            Self::SecretLookup { .. } => 500,
            Self::Dispatch(_) => 500,
        }
    }

    /// Check if the provider should redeliver
    pub fn is_transient(&self) -> bool {
        self.status_code() >= 500
    }

    /// Get error category for monitoring
    pub fn error_category(&self) -> ErrorCategory {
        match self {
            Self::Signature(e) => e.error_category(),
            Self::MalformedPayload { .. } => ErrorCategory::Permanent,
            Self::UnknownWebhook { .. } => ErrorCategory::Permanent,
            Self::SecretLookup { .. } => ErrorCategory::Transient,
            Self::Dispatch(e) if e.is_transient() => ErrorCategory::Transient,
            Self::Dispatch(_) => ErrorCategory::Permanent,
        }
    }
}

// ============================================================================
// Secret resolution
// ============================================================================

/// Source of verification secrets for physical webhooks
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Secret for `webhook_id`; `None` while registration is unfinished
    async fn secret_for(&self, webhook_id: &WebhookId) -> Result<Option<WebhookSecret>, String>;
}

#[async_trait]
impl SecretResolver for SubscriptionReconciler {
    async fn secret_for(&self, webhook_id: &WebhookId) -> Result<Option<WebhookSecret>, String> {
        SubscriptionReconciler::secret_for(self, webhook_id)
            .await
            .map_err(|e| e.to_string())
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Default number of `(delivery, subscriber)` pairs remembered
pub const DEFAULT_RECENT_DELIVERIES: usize = 4096;

type DeliveryKey = (WebhookId, SubscriberId, String);

/// Bounded record of deliveries already dispatched; oldest entries go first
#[derive(Debug)]
struct RecentDeliveries {
    capacity: usize,
    order: VecDeque<DeliveryKey>,
    seen: HashSet<DeliveryKey>,
}

impl RecentDeliveries {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn contains(&self, key: &DeliveryKey) -> bool {
        self.seen.contains(key)
    }

    fn insert(&mut self, key: DeliveryKey) {
        if self.capacity == 0 || !self.seen.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }
}

/// Verifies, filters, normalizes and dispatches deliveries
pub struct IngressPipeline {
    secrets: Arc<dyn SecretResolver>,
    sink: Arc<dyn EventSink>,
    recent: Mutex<RecentDeliveries>,
}

impl IngressPipeline {
    pub fn new(secrets: Arc<dyn SecretResolver>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            secrets,
            sink,
            recent: Mutex::new(RecentDeliveries::new(DEFAULT_RECENT_DELIVERIES)),
        }
    }

    /// Remember at most `capacity` dispatched deliveries; zero disables the check
    pub fn with_recent_deliveries(mut self, capacity: usize) -> Self {
        self.recent = Mutex::new(RecentDeliveries::new(capacity));
        self
    }

    /// Process one delivery for one subscriber
    ///
    /// `headers` must have lowercased names.
    ///
    /// # Errors
    ///
    /// See [`IngressError::status_code`] for the HTTP mapping.
    #[instrument(skip_all, fields(subscriber = %subscription.subscriber_id, webhook_id = %subscription.webhook_id))]
    pub async fn handle_inbound(
        &self,
        subscription: &IngressSubscription,
        headers: &HashMap<String, String>,
        raw_body: &[u8],
    ) -> Result<IngressOutcome, IngressError> {
        let profile = &subscription.profile;

        // Step 1: event type and resource kind. A body-sourced type is read
        // leniently here; a malformed body is reported after verification.
        let early_payload = if profile.event_type.needs_body() {
            serde_json::from_slice::<serde_json::Value>(raw_body).ok()
        } else {
            None
        };
        let event_type = profile
            .event_type
            .resolve(headers, early_payload.as_ref());

        if let Some(event_type) = &event_type {
            let kind = profile.resource_kind_for(event_type);
            if !subscription.resource_kinds.is_empty() && !subscription.resource_kinds.contains(&kind)
            {
                debug!(event_type = %event_type, resource_kind = %kind, "Resource kind not tracked");
                return Ok(IngressOutcome::Ignored {
                    reason: format!("resource kind '{}' not tracked", kind),
                });
            }
        }

        // Step 2: signature
        let secret = self
            .secrets
            .secret_for(&subscription.webhook_id)
            .await
            .map_err(|message| IngressError::SecretLookup { message })?;
        let provided = headers.get(&profile.signature.header_key()).map(String::as_str);

        if let Err(e) = signature::verify(secret.as_ref(), raw_body, provided, &profile.signature) {
            warn!(error = %e, "Rejected delivery");
            return Err(e.into());
        }

        // Step 3: payload
        let payload = match early_payload {
            Some(payload) => payload,
            None => serde_json::from_slice::<serde_json::Value>(raw_body).map_err(|e| {
                IngressError::MalformedPayload {
                    message: e.to_string(),
                }
            })?,
        };

        let Some(event_type) = event_type.or_else(|| profile.event_type.resolve(headers, Some(&payload)))
        else {
            return Err(IngressError::MalformedPayload {
                message: "event type could not be determined".to_string(),
            });
        };
        let action = profile
            .action
            .as_ref()
            .and_then(|source| source.resolve(headers, Some(&payload)));

        // Step 4: redelivery of an event this subscriber already received
        let delivery_key = profile
            .delivery_id
            .as_ref()
            .and_then(|source| source.resolve(headers, Some(&payload)))
            .map(|id| (subscription.webhook_id, subscription.subscriber_id.clone(), id));
        if let Some(key) = &delivery_key {
            if self.recent.lock().await.contains(key) {
                debug!(delivery_id = %key.2, "Delivery already dispatched");
                return Ok(IngressOutcome::Ignored {
                    reason: format!("delivery '{}' already dispatched", key.2),
                });
            }
        }

        // Step 5: subscriber filter
        if let Some(reason) = subscription
            .filter
            .mismatch(&event_type, action.as_deref(), &payload)
        {
            debug!(event_type = %event_type, reason = %reason, "Event filtered out");
            return Ok(IngressOutcome::Ignored { reason });
        }

        // Step 6: dispatch
        let event = NormalizedEvent {
            event_id: EventId::new(),
            provider: profile.provider.clone(),
            scope: subscription.scope.clone(),
            webhook_id: subscription.webhook_id,
            subscriber_id: subscription.subscriber_id.clone(),
            event_type,
            action,
            received_at: Timestamp::now(),
            payload,
        };
        let event_id = event.event_id;
        let event_type = event.event_type.clone();

        let value = serde_json::to_value(&event).map_err(|e| IngressError::MalformedPayload {
            message: e.to_string(),
        })?;
        self.sink
            .emit(&subscription.channel, &event_type, value)
            .await?;

        if let Some(key) = delivery_key {
            self.recent.lock().await.insert(key);
        }

        info!(event_id = %event_id, event_type = %event_type, "Dispatched event");
        Ok(IngressOutcome::Dispatched { event_id })
    }
}

// ============================================================================
// Router
// ============================================================================

/// Ingress subscriptions indexed by physical webhook
#[derive(Debug, Clone, Default)]
pub struct IngressRegistry {
    subscriptions: Arc<RwLock<HashMap<WebhookId, Vec<IngressSubscription>>>>,
}

impl IngressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a subscriber's ingress subscription
    pub async fn register(&self, subscription: IngressSubscription) {
        let mut subscriptions = self.subscriptions.write().await;
        let entries = subscriptions.entry(subscription.webhook_id).or_default();
        entries.retain(|s| s.subscriber_id != subscription.subscriber_id);
        entries.push(subscription);
    }

    /// Remove a subscriber; returns `true` when it was registered
    pub async fn unregister(&self, webhook_id: &WebhookId, subscriber: &SubscriberId) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let Some(entries) = subscriptions.get_mut(webhook_id) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|s| &s.subscriber_id != subscriber);
        let removed = entries.len() != before;

        if entries.is_empty() {
            subscriptions.remove(webhook_id);
        }
        removed
    }

    /// Every subscription attached to a webhook
    pub async fn subscriptions_for(&self, webhook_id: &WebhookId) -> Vec<IngressSubscription> {
        self.subscriptions
            .read()
            .await
            .get(webhook_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Per-subscriber results of one delivery
#[derive(Debug)]
pub struct DeliveryReport {
    pub results: Vec<(SubscriberId, Result<IngressOutcome, IngressError>)>,
}

impl DeliveryReport {
    /// Most severe status across subscribers
    ///
    /// Server errors outrank rejections so the provider redelivers.
    pub fn status_code(&self) -> u16 {
        self.results
            .iter()
            .map(|(_, result)| match result {
                Ok(_) => 200,
                Err(e) => e.status_code(),
            })
            .max_by_key(|status| severity(*status))
            .unwrap_or(200)
    }

    pub fn dispatched(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(IngressOutcome::Dispatched { .. })))
            .count()
    }

    pub fn ignored(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(IngressOutcome::Ignored { .. })))
            .count()
    }

    /// First error message, for response bodies
    pub fn first_error(&self) -> Option<String> {
        self.results
            .iter()
            .find_map(|(_, r)| r.as_ref().err().map(|e| e.to_string()))
    }
}

fn severity(status: u16) -> u8 {
    match status {
        500..=599 => 4,
        403 => 3,
        400..=499 => 2,
        _ => 1,
    }
}

/// Fans physical deliveries out to every attached subscriber
pub struct IngressRouter {
    registry: IngressRegistry,
    pipeline: IngressPipeline,
}

impl IngressRouter {
    pub fn new(registry: IngressRegistry, pipeline: IngressPipeline) -> Self {
        Self { registry, pipeline }
    }

    pub fn registry(&self) -> &IngressRegistry {
        &self.registry
    }

    /// Deliver a raw request received at `/{provider}/{webhook_id}`
    ///
    /// Subscribers are processed in order, each verified independently.
    ///
    /// # Errors
    ///
    /// [`IngressError::UnknownWebhook`] when the ID is malformed, unknown, or
    /// registered under a different provider.
    #[instrument(skip(self, headers, raw_body), fields(body_size = raw_body.len()))]
    pub async fn deliver(
        &self,
        provider: &str,
        webhook_id: &str,
        headers: &HashMap<String, String>,
        raw_body: &[u8],
    ) -> Result<DeliveryReport, IngressError> {
        let unknown = || IngressError::UnknownWebhook {
            webhook_id: webhook_id.to_string(),
        };

        let id: WebhookId = webhook_id.parse().map_err(|_| unknown())?;
        let subscriptions: Vec<IngressSubscription> = self
            .registry
            .subscriptions_for(&id)
            .await
            .into_iter()
            .filter(|s| s.provider().as_str() == provider)
            .collect();

        if subscriptions.is_empty() {
            return Err(unknown());
        }

        let mut results = Vec::with_capacity(subscriptions.len());
        for subscription in &subscriptions {
            let result = self
                .pipeline
                .handle_inbound(subscription, headers, raw_body)
                .await;
            results.push((subscription.subscriber_id.clone(), result));
        }

        Ok(DeliveryReport { results })
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
