//! # Filesystem Stores
//!
//! Durable stores writing one JSON document per record:
//!
//! ```text
//! <base>/webhooks/<webhook_id>.json
//! <base>/correlations/<hex(execution)>.json
//! ```
//!
//! Writes go to a temporary file that is renamed over the target, so a
//! crash never leaves a half-written record behind. Lookups by secondary
//! key scan the directory; record counts are small (one per scope or per
//! in-flight execution).

use crate::completion::{correlated_execution, CorrelationRecord, CorrelationStore};
use crate::subscription::{PhysicalWebhook, SubscriptionStore};
use crate::{ExecutionRef, ExternalJobKey, ProviderId, Scope, StoreError, WebhookId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Longest hex-encoded execution ref used verbatim as a file name
const MAX_HEX_NAME_LEN: usize = 128;

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(&json).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_file(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Read every `*.json` record in `dir`, skipping unreadable ones
async fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let mut records = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match read_json::<T>(&path).await {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable record");
            }
        }
    }

    Ok(records)
}

// ============================================================================
// Subscriptions
// ============================================================================

/// Filesystem-backed [`SubscriptionStore`]
///
/// # Examples
///
/// ```no_run
/// use hook_keeper_core::adapters::FilesystemSubscriptionStore;
/// use std::path::PathBuf;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = FilesystemSubscriptionStore::new(PathBuf::from("./data")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FilesystemSubscriptionStore {
    dir: PathBuf,
}

impl FilesystemSubscriptionStore {
    /// Open (creating if needed) the store under `base_path`
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created.
    pub async fn new(base_path: PathBuf) -> Result<Self, StoreError> {
        let dir = base_path.join("webhooks");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, webhook_id: &WebhookId) -> PathBuf {
        self.dir.join(format!("{}.json", webhook_id))
    }
}

#[async_trait]
impl SubscriptionStore for FilesystemSubscriptionStore {
    async fn get(
        &self,
        provider: &ProviderId,
        scope: &Scope,
    ) -> Result<Option<PhysicalWebhook>, StoreError> {
        let webhooks: Vec<PhysicalWebhook> = read_all(&self.dir).await?;
        Ok(webhooks
            .into_iter()
            .find(|w| &w.provider == provider && &w.scope == scope))
    }

    async fn get_by_id(
        &self,
        webhook_id: &WebhookId,
    ) -> Result<Option<PhysicalWebhook>, StoreError> {
        read_json(&self.path_for(webhook_id)).await
    }

    async fn put(&self, webhook: &PhysicalWebhook) -> Result<(), StoreError> {
        write_json_atomic(&self.path_for(&webhook.webhook_id), webhook).await
    }

    async fn remove(&self, webhook_id: &WebhookId) -> Result<(), StoreError> {
        remove_file(&self.path_for(webhook_id)).await
    }

    async fn list(&self) -> Result<Vec<PhysicalWebhook>, StoreError> {
        read_all(&self.dir).await
    }
}

// ============================================================================
// Correlations
// ============================================================================

/// Filesystem-backed [`CorrelationStore`]
#[derive(Debug, Clone)]
pub struct FilesystemCorrelationStore {
    dir: PathBuf,
}

impl FilesystemCorrelationStore {
    /// Open (creating if needed) the store under `base_path`
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created.
    pub async fn new(base_path: PathBuf) -> Result<Self, StoreError> {
        let dir = base_path.join("correlations");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    // Execution refs are opaque and may contain path separators. Refs whose
    // hex form would exceed common filename limits are stored under their
    // digest; hex names never contain '-', so the two forms cannot collide.
    fn path_for(&self, execution: &ExecutionRef) -> PathBuf {
        let encoded = hex::encode(execution.as_str());
        let name = if encoded.len() <= MAX_HEX_NAME_LEN {
            encoded
        } else {
            format!("sha256-{}", hex::encode(Sha256::digest(execution.as_str())))
        };
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl CorrelationStore for FilesystemCorrelationStore {
    async fn get(&self, execution: &ExecutionRef) -> Result<Option<CorrelationRecord>, StoreError> {
        read_json(&self.path_for(execution)).await
    }

    async fn find_by_job(
        &self,
        provider: &ProviderId,
        job_key: &ExternalJobKey,
    ) -> Result<Option<ExecutionRef>, StoreError> {
        let records: Vec<CorrelationRecord> = read_all(&self.dir).await?;
        Ok(correlated_execution(&records, provider, job_key))
    }

    async fn put(&self, record: &CorrelationRecord) -> Result<(), StoreError> {
        write_json_atomic(&self.path_for(&record.correlation.execution), record).await
    }

    async fn remove(&self, execution: &ExecutionRef) -> Result<(), StoreError> {
        remove_file(&self.path_for(execution)).await
    }

    async fn list(&self) -> Result<Vec<CorrelationRecord>, StoreError> {
        read_all(&self.dir).await
    }
}

#[cfg(test)]
#[path = "filesystem_store_tests.rs"]
mod tests;
