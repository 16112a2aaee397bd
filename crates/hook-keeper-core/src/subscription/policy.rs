//! Per-provider equivalence and merge rules for shared webhooks.
//!
//! Every provider decides for itself whether an existing registration already
//! serves a new subscriber, and how two configurations combine when it does
//! not. The reconciler only talks to the [`MergePolicy`] trait.

use super::SubscriptionError;
use crate::{EventSet, ProviderId, Scope};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The part of a webhook registration that policies compare
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub scope: Scope,
    pub events: EventSet,

    /// Provider-specific discriminator beyond the scope (team flag, branch, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_key: Option<String>,
}

impl WebhookConfig {
    /// Create a config without a secondary key
    pub fn new(scope: Scope, events: EventSet) -> Self {
        Self {
            scope,
            events,
            secondary_key: None,
        }
    }

    /// Attach a secondary key
    pub fn with_secondary_key(mut self, key: impl Into<String>) -> Self {
        self.secondary_key = Some(key.into());
        self
    }
}

/// Equivalence and merge rule for one provider
pub trait MergePolicy: Send + Sync + fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// True when `existing` already serves `requested` without changes
    fn equivalent(&self, existing: &WebhookConfig, requested: &WebhookConfig) -> bool;

    /// Combine `existing` with `requested`
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::SubscriptionConflict`] when the two
    /// configurations cannot share one registration.
    fn merge(
        &self,
        existing: &WebhookConfig,
        requested: &WebhookConfig,
    ) -> Result<WebhookConfig, SubscriptionError>;
}

fn ensure_same_scope(
    existing: &WebhookConfig,
    requested: &WebhookConfig,
) -> Result<(), SubscriptionError> {
    if existing.scope != requested.scope {
        return Err(SubscriptionError::SubscriptionConflict {
            reason: format!(
                "scope '{}' cannot merge with scope '{}'",
                existing.scope, requested.scope
            ),
        });
    }
    Ok(())
}

// ============================================================================
// Shipped policies
// ============================================================================

/// Same scope and existing events cover the requested ones
///
/// Default for providers without a registered policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupersetPolicy;

impl MergePolicy for SupersetPolicy {
    fn name(&self) -> &'static str {
        "superset"
    }

    fn equivalent(&self, existing: &WebhookConfig, requested: &WebhookConfig) -> bool {
        existing.scope == requested.scope && existing.events.is_superset_of(&requested.events)
    }

    fn merge(
        &self,
        existing: &WebhookConfig,
        requested: &WebhookConfig,
    ) -> Result<WebhookConfig, SubscriptionError> {
        ensure_same_scope(existing, requested)?;
        Ok(WebhookConfig {
            scope: existing.scope.clone(),
            events: existing.events.union(&requested.events),
            secondary_key: existing
                .secondary_key
                .clone()
                .or_else(|| requested.secondary_key.clone()),
        })
    }
}

/// Same scope and identical event sets
///
/// For providers (GitHub) whose registrations are compared on the full
/// event list. A subset request is not equivalent, so the registration is
/// re-asserted with the union.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactEventsPolicy;

impl MergePolicy for ExactEventsPolicy {
    fn name(&self) -> &'static str {
        "exact_events"
    }

    fn equivalent(&self, existing: &WebhookConfig, requested: &WebhookConfig) -> bool {
        existing.scope == requested.scope && existing.events == requested.events
    }

    fn merge(
        &self,
        existing: &WebhookConfig,
        requested: &WebhookConfig,
    ) -> Result<WebhookConfig, SubscriptionError> {
        SupersetPolicy.merge(existing, requested)
    }
}

/// Same scope, same secondary key, and existing events cover the requested ones
///
/// Registrations with different secondary keys can never be shared.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeKeyPolicy;

impl MergePolicy for ScopeKeyPolicy {
    fn name(&self) -> &'static str {
        "scope_key"
    }

    fn equivalent(&self, existing: &WebhookConfig, requested: &WebhookConfig) -> bool {
        existing.secondary_key == requested.secondary_key
            && SupersetPolicy.equivalent(existing, requested)
    }

    fn merge(
        &self,
        existing: &WebhookConfig,
        requested: &WebhookConfig,
    ) -> Result<WebhookConfig, SubscriptionError> {
        ensure_same_scope(existing, requested)?;
        if existing.secondary_key != requested.secondary_key {
            return Err(SubscriptionError::SubscriptionConflict {
                reason: format!(
                    "secondary key {:?} differs from registered {:?}",
                    requested.secondary_key, existing.secondary_key
                ),
            });
        }
        SupersetPolicy.merge(existing, requested)
    }
}

/// Policy names accepted in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Superset,
    ExactEvents,
    ScopeKey,
}

impl PolicyKind {
    /// Instantiate the named policy
    pub fn build(self) -> Arc<dyn MergePolicy> {
        match self {
            Self::Superset => Arc::new(SupersetPolicy),
            Self::ExactEvents => Arc::new(ExactEventsPolicy),
            Self::ScopeKey => Arc::new(ScopeKeyPolicy),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Merge policies indexed by provider
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<ProviderId, Arc<dyn MergePolicy>>,
    fallback: Arc<dyn MergePolicy>,
}

impl PolicyRegistry {
    /// Registry where every provider uses [`SupersetPolicy`]
    pub fn new() -> Self {
        Self {
            policies: HashMap::new(),
            fallback: Arc::new(SupersetPolicy),
        }
    }

    /// Register the policy for one provider
    pub fn register(&mut self, provider: ProviderId, policy: Arc<dyn MergePolicy>) {
        self.policies.insert(provider, policy);
    }

    /// Builder-style registration
    pub fn with_policy(mut self, provider: ProviderId, policy: Arc<dyn MergePolicy>) -> Self {
        self.register(provider, policy);
        self
    }

    /// Policy for `provider`, falling back to the superset rule
    pub fn policy_for(&self, provider: &ProviderId) -> Arc<dyn MergePolicy> {
        self.policies
            .get(provider)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
