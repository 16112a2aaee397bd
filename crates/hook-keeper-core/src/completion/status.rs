//! Provider status vocabularies.

use super::JobStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maps a provider's raw sub-job statuses onto [`JobStatus`]
///
/// Lookups are case-insensitive. Statuses the vocabulary does not know map
/// to [`JobStatus::Unknown`], which never completes a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusVocabulary {
    statuses: HashMap<String, JobStatus>,
}

impl StatusVocabulary {
    /// Vocabulary with no known statuses
    pub fn empty() -> Self {
        Self {
            statuses: HashMap::new(),
        }
    }

    /// Add or replace one mapping
    pub fn with_status(mut self, raw: &str, status: JobStatus) -> Self {
        self.statuses.insert(raw.trim().to_ascii_lowercase(), status);
        self
    }

    /// Map a raw provider status
    pub fn classify(&self, raw: &str) -> JobStatus {
        self.statuses
            .get(&raw.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(JobStatus::Unknown)
    }

    /// Merge `other` over this vocabulary
    pub fn extended_with(mut self, other: &StatusVocabulary) -> Self {
        for (raw, status) in &other.statuses {
            self.statuses.insert(raw.clone(), *status);
        }
        self
    }
}

impl Default for StatusVocabulary {
    /// Statuses shared by the common CI providers
    fn default() -> Self {
        Self::empty()
            .with_status("pending", JobStatus::Pending)
            .with_status("queued", JobStatus::Pending)
            .with_status("not_run", JobStatus::Pending)
            .with_status("running", JobStatus::Running)
            .with_status("on_hold", JobStatus::Running)
            .with_status("failing", JobStatus::Running)
            .with_status("success", JobStatus::Succeeded)
            .with_status("succeeded", JobStatus::Succeeded)
            .with_status("failed", JobStatus::Failed)
            .with_status("error", JobStatus::Failed)
            .with_status("unauthorized", JobStatus::Failed)
            .with_status("infrastructure_fail", JobStatus::Failed)
            .with_status("timedout", JobStatus::Failed)
            .with_status("canceled", JobStatus::Canceled)
            .with_status("cancelled", JobStatus::Canceled)
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
