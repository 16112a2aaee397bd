//! # In-Memory Stores
//!
//! Thread-safe in-memory stores for testing and single-process deployments.
//! State does not survive a restart.

use crate::completion::{correlated_execution, CorrelationRecord, CorrelationStore};
use crate::subscription::{PhysicalWebhook, SubscriptionStore};
use crate::{ExecutionRef, ExternalJobKey, ProviderId, Scope, StoreError, WebhookId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory [`SubscriptionStore`]
#[derive(Debug, Clone, Default)]
pub struct InMemorySubscriptionStore {
    webhooks: Arc<RwLock<HashMap<WebhookId, PhysicalWebhook>>>,
}

impl InMemorySubscriptionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored webhooks
    pub async fn len(&self) -> usize {
        self.webhooks.read().await.len()
    }

    /// Check if the store is empty
    pub async fn is_empty(&self) -> bool {
        self.webhooks.read().await.is_empty()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get(
        &self,
        provider: &ProviderId,
        scope: &Scope,
    ) -> Result<Option<PhysicalWebhook>, StoreError> {
        let webhooks = self.webhooks.read().await;
        Ok(webhooks
            .values()
            .find(|w| &w.provider == provider && &w.scope == scope)
            .cloned())
    }

    async fn get_by_id(
        &self,
        webhook_id: &WebhookId,
    ) -> Result<Option<PhysicalWebhook>, StoreError> {
        Ok(self.webhooks.read().await.get(webhook_id).cloned())
    }

    async fn put(&self, webhook: &PhysicalWebhook) -> Result<(), StoreError> {
        self.webhooks
            .write()
            .await
            .insert(webhook.webhook_id, webhook.clone());
        Ok(())
    }

    async fn remove(&self, webhook_id: &WebhookId) -> Result<(), StoreError> {
        self.webhooks.write().await.remove(webhook_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PhysicalWebhook>, StoreError> {
        Ok(self.webhooks.read().await.values().cloned().collect())
    }
}

/// In-memory [`CorrelationStore`]
#[derive(Debug, Clone, Default)]
pub struct InMemoryCorrelationStore {
    records: Arc<RwLock<HashMap<ExecutionRef, CorrelationRecord>>>,
}

impl InMemoryCorrelationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CorrelationStore for InMemoryCorrelationStore {
    async fn get(&self, execution: &ExecutionRef) -> Result<Option<CorrelationRecord>, StoreError> {
        Ok(self.records.read().await.get(execution).cloned())
    }

    async fn find_by_job(
        &self,
        provider: &ProviderId,
        job_key: &ExternalJobKey,
    ) -> Result<Option<ExecutionRef>, StoreError> {
        let records = self.records.read().await;
        Ok(correlated_execution(records.values(), provider, job_key))
    }

    async fn put(&self, record: &CorrelationRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.correlation.execution.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, execution: &ExecutionRef) -> Result<(), StoreError> {
        self.records.write().await.remove(execution);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CorrelationRecord>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
#[path = "memory_store_tests.rs"]
mod tests;
