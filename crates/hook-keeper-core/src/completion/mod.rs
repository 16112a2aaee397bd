//! # Async Completion Reconciler
//!
//! Decides the terminal outcome of a dispatched remote job from two racing
//! signals: webhook pushes and a recurring fallback poll.
//!
//! ## State machine
//!
//! ```text
//! Dispatched ──► Polling / WebhookAwaited ──► Terminal(Succeeded | Failed | TimedOut)
//!                    ▲           │
//!                    └───────────┘ (inconclusive)
//! ```
//!
//! Every execution is owned by a single actor task. Webhook updates, poll
//! ticks, cancellation and snapshot requests are messages on its queue, so
//! the terminal latch is only ever touched by one task. The latch is set and
//! persisted before the outcome is emitted, which makes emission at most
//! once per execution.

use crate::{
    ErrorCategory, ExecutionRef, ExternalJobKey, ProviderError, ProviderId, RetryPolicy,
    StoreError, SubJobId, Timestamp,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

mod actor;
pub mod reconciler;
pub mod router;
pub mod status;

#[cfg(test)]
mod test_support;

pub use reconciler::CompletionReconciler;
pub use router::{CompletionEventRouter, CompletionFieldPaths};
pub use status::StatusVocabulary;

// ============================================================================
// Status model
// ============================================================================

/// Normalized status of one sub-job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    /// Provider status outside the known vocabulary
    Unknown,
}

impl JobStatus {
    /// True for statuses that end a sub-job
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// True for statuses that fail the whole job
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Final outcome of an execution's remote job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    Succeeded,
    Failed,
    /// The poll ceiling was reached without a terminal aggregate
    TimedOut,
}

impl CompletionOutcome {
    /// Event type emitted on the execution's output channel
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Succeeded => "completion.succeeded",
            Self::Failed => "completion.failed",
            Self::TimedOut => "completion.timed_out",
        }
    }
}

impl fmt::Display for CompletionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Aggregate of all sub-job statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    /// No sub-jobs yet, or at least one is still running
    Inconclusive,
    Succeeded,
    Failed,
}

/// Evaluate the aggregate status of a job's sub-jobs
///
/// An empty set cannot be decided. Any non-terminal sub-job keeps the job
/// open; once all are done any failure wins over success.
pub fn evaluate(sub_jobs: &BTreeMap<SubJobId, JobStatus>) -> Aggregate {
    if sub_jobs.is_empty() {
        return Aggregate::Inconclusive;
    }

    if sub_jobs.values().any(|status| !status.is_terminal()) {
        return Aggregate::Inconclusive;
    }

    if sub_jobs.values().any(JobStatus::is_failure) {
        Aggregate::Failed
    } else {
        Aggregate::Succeeded
    }
}

// ============================================================================
// Records
// ============================================================================

/// Link between a remote job and the execution that dispatched it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCorrelation {
    pub execution: ExecutionRef,
    pub provider: ProviderId,
    pub job_key: ExternalJobKey,

    /// Output channel the terminal outcome is emitted on
    pub channel: String,

    /// Per-dispatch override of the configured poll interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_seconds: Option<u64>,

    pub created_at: Timestamp,
}

/// Reconciliation progress of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCompletionState {
    pub sub_jobs: BTreeMap<SubJobId, JobStatus>,

    /// Set exactly once; no mutation or emission happens afterwards
    pub terminal: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CompletionOutcome>,

    #[serde(default)]
    pub poll_attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_polled_at: Option<Timestamp>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_at: Option<Timestamp>,

    pub updated_at: Timestamp,
}

impl JobCompletionState {
    /// Fresh state with every known sub-job pending
    pub fn new(sub_jobs: impl IntoIterator<Item = SubJobId>) -> Self {
        Self {
            sub_jobs: sub_jobs
                .into_iter()
                .map(|id| (id, JobStatus::Pending))
                .collect(),
            terminal: false,
            outcome: None,
            poll_attempts: 0,
            last_polled_at: None,
            terminal_at: None,
            updated_at: Timestamp::now(),
        }
    }

    /// Current aggregate of the tracked sub-jobs
    pub fn aggregate(&self) -> Aggregate {
        evaluate(&self.sub_jobs)
    }

    /// IDs of every tracked sub-job
    pub fn sub_job_ids(&self) -> Vec<SubJobId> {
        self.sub_jobs.keys().cloned().collect()
    }
}

/// Stored unit: correlation plus state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationRecord {
    pub correlation: JobCorrelation,
    pub state: JobCompletionState,
}

/// Execution a `(provider, job key)` resolves to among `records`
///
/// An open record wins over terminal ones; among equals the most recently
/// created wins.
pub fn correlated_execution<'a>(
    records: impl IntoIterator<Item = &'a CorrelationRecord>,
    provider: &ProviderId,
    job_key: &ExternalJobKey,
) -> Option<ExecutionRef> {
    records
        .into_iter()
        .filter(|r| &r.correlation.provider == provider && &r.correlation.job_key == job_key)
        .max_by_key(|r| (!r.state.terminal, r.correlation.created_at))
        .map(|r| r.correlation.execution.clone())
}

/// Durable keyed storage for correlations
///
/// Records are addressable by execution and by `(provider, job key)`.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Record for an execution, if any
    async fn get(&self, execution: &ExecutionRef) -> Result<Option<CorrelationRecord>, StoreError>;

    /// Execution that dispatched `job_key` at `provider`, if any
    ///
    /// When a job key was reused, the open execution is returned in
    /// preference to terminal ones (see [`correlated_execution`]).
    async fn find_by_job(
        &self,
        provider: &ProviderId,
        job_key: &ExternalJobKey,
    ) -> Result<Option<ExecutionRef>, StoreError>;

    /// Insert or replace a record
    async fn put(&self, record: &CorrelationRecord) -> Result<(), StoreError>;

    /// Remove a record; removing a missing record is not an error
    async fn remove(&self, execution: &ExecutionRef) -> Result<(), StoreError>;

    /// Every stored record
    async fn list(&self) -> Result<Vec<CorrelationRecord>, StoreError>;
}

// ============================================================================
// Configuration and requests
// ============================================================================

/// Reconciler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionConfig {
    /// Fallback poll interval while an execution is open
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,

    /// Poll ceiling; `None` polls until the provider reports completion
    #[serde(default)]
    pub max_poll_attempts: Option<u32>,

    /// Retry policy for transient event sink failures
    #[serde(default)]
    pub emit_retry: RetryPolicy,

    /// Capacity of each execution's command queue
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

fn default_poll_interval_seconds() -> u64 {
    180
}

fn default_command_buffer() -> usize {
    64
}

impl CompletionConfig {
    /// Default poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            max_poll_attempts: None,
            emit_retry: RetryPolicy::default(),
            command_buffer: default_command_buffer(),
        }
    }
}

/// Everything known about a remote job at dispatch time
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub execution: ExecutionRef,
    pub provider: ProviderId,
    pub job_key: ExternalJobKey,
    pub channel: String,

    /// Sub-jobs known up front; more may appear via webhook or poll
    pub sub_jobs: Vec<SubJobId>,

    pub poll_interval: Option<Duration>,
}

impl DispatchRequest {
    /// Create a request with no known sub-jobs and the default poll interval
    pub fn new(
        execution: ExecutionRef,
        provider: ProviderId,
        job_key: ExternalJobKey,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            execution,
            provider,
            job_key,
            channel: channel.into(),
            sub_jobs: Vec::new(),
            poll_interval: None,
        }
    }

    /// Declare sub-jobs known at dispatch time
    pub fn with_sub_jobs(mut self, sub_jobs: impl IntoIterator<Item = SubJobId>) -> Self {
        self.sub_jobs = sub_jobs.into_iter().collect();
        self
    }

    /// Override the poll interval for this execution
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }
}

/// Effect of one reconciliation input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// No correlation exists; the job was not started by this system
    NotOurs,

    /// The execution already completed; the input was ignored
    AlreadyTerminal,

    /// State updated, aggregate still inconclusive
    Pending,

    /// This input completed the execution
    Completed(CompletionOutcome),
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the completion reconciler
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Execution '{execution}' is already tracked")]
    DuplicateDispatch { execution: ExecutionRef },

    #[error("Job '{job_key}' at '{provider}' is already tracked by open execution '{execution}'")]
    JobKeyInUse {
        provider: ProviderId,
        job_key: ExternalJobKey,
        execution: ExecutionRef,
    },

    #[error("Execution '{execution}' is not tracked")]
    UnknownExecution { execution: ExecutionRef },

    #[error("No adapter registered for provider '{provider}'")]
    UnknownProvider { provider: ProviderId },

    #[error("Provider call failed: {0}")]
    ProviderUnavailable(#[from] ProviderError),

    #[error("Correlation store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Reconciliation task for execution '{execution}' stopped")]
    ActorStopped { execution: ExecutionRef },
}

impl CompletionError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::DuplicateDispatch { .. } => false,
            Self::JobKeyInUse { .. } => false,
            Self::UnknownExecution { .. } => false,
            Self::UnknownProvider { .. } => false,
            Self::ProviderUnavailable(e) => e.is_transient(),
            Self::Store(e) => e.is_transient(),
            Self::ActorStopped { .. } => true,
        }
    }

    /// Get error category for monitoring
    pub fn error_category(&self) -> ErrorCategory {
        match self {
            Self::DuplicateDispatch { .. } => ErrorCategory::Permanent,
            Self::JobKeyInUse { .. } => ErrorCategory::Permanent,
            Self::UnknownExecution { .. } => ErrorCategory::Permanent,
            Self::UnknownProvider { .. } => ErrorCategory::Configuration,
            Self::ProviderUnavailable(e) => e.error_category(),
            Self::Store(e) if e.is_transient() => ErrorCategory::Transient,
            Self::Store(_) => ErrorCategory::Permanent,
            Self::ActorStopped { .. } => ErrorCategory::Transient,
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
