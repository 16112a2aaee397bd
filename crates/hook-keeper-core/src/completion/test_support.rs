//! Fakes shared by the completion tests.

use super::{CompletionConfig, CompletionReconciler, CorrelationRecord, CorrelationStore};
use crate::adapters::InMemoryCorrelationStore;
use crate::provider::{
    CancelOutcome, ProviderAdapter, ProviderError, ProviderRegistry, SubJobStatus,
    WebhookRegistration,
};
use crate::{
    EventSink, ExecutionRef, ExternalJobKey, ExternalWebhookId, ProviderId, SinkError, StoreError,
    SubJobId,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Provider whose poll and cancel responses are set by the test
pub(crate) struct ScriptedAdapter {
    provider: ProviderId,
    statuses: Mutex<Vec<SubJobStatus>>,
    fail_polls: AtomicBool,
    cancel: Mutex<CancelOutcome>,
    polls: AtomicUsize,
}

impl ScriptedAdapter {
    pub(crate) fn new(provider: &str) -> Self {
        Self {
            provider: ProviderId::new(provider).unwrap(),
            statuses: Mutex::new(Vec::new()),
            fail_polls: AtomicBool::new(false),
            cancel: Mutex::new(CancelOutcome::Requested),
            polls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_statuses(&self, statuses: &[(&str, &str)]) {
        *self.statuses.lock().unwrap() = statuses
            .iter()
            .map(|(id, status)| SubJobStatus::new(SubJobId::new(*id).unwrap(), *status))
            .collect();
    }

    pub(crate) fn fail_polls(&self, fail: bool) {
        self.fail_polls.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_cancel(&self, outcome: CancelOutcome) {
        *self.cancel.lock().unwrap() = outcome;
    }

    pub(crate) fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider_id(&self) -> &ProviderId {
        &self.provider
    }

    async fn create_or_update_webhook(
        &self,
        _registration: &WebhookRegistration,
    ) -> Result<ExternalWebhookId, ProviderError> {
        Ok(ExternalWebhookId::new("hook-1").unwrap())
    }

    async fn delete_webhook(&self, _external_id: &ExternalWebhookId) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn fetch_job_status(
        &self,
        _job_key: &ExternalJobKey,
        _known_sub_jobs: &[SubJobId],
    ) -> Result<Vec<SubJobStatus>, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable {
                message: "503 from provider".to_string(),
            });
        }
        Ok(self.statuses.lock().unwrap().clone())
    }

    async fn cancel_job(&self, _job_key: &ExternalJobKey) -> Result<CancelOutcome, ProviderError> {
        Ok(*self.cancel.lock().unwrap())
    }
}

/// Sink recording every successful emission
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<(String, String, serde_json::Value)>>,
    transient_failures: AtomicU32,
    reject_all: AtomicBool,
    attempts: AtomicUsize,
}

impl RecordingSink {
    /// Fail the next `n` emissions with a transient error
    pub(crate) fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn reject_all(&self) {
        self.reject_all.store(true, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, event_type, _)| event_type.clone())
            .collect()
    }

    pub(crate) fn events(&self) -> Vec<(String, String, serde_json::Value)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(
        &self,
        channel: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.reject_all.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected {
                message: "schema mismatch".to_string(),
            });
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SinkError::Unavailable {
                message: "broker unavailable".to_string(),
            });
        }

        self.events
            .lock()
            .unwrap()
            .push((channel.to_string(), event_type.to_string(), payload));
        Ok(())
    }
}

pub(crate) struct Harness {
    pub adapter: Arc<ScriptedAdapter>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<InMemoryCorrelationStore>,
    pub reconciler: CompletionReconciler,
}

pub(crate) fn harness(config: CompletionConfig) -> Harness {
    let adapter = Arc::new(ScriptedAdapter::new("circleci"));
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(InMemoryCorrelationStore::new());
    let reconciler = CompletionReconciler::new(
        config,
        Arc::new(ProviderRegistry::new().with_adapter(adapter.clone())),
        sink.clone(),
        store.clone(),
    );
    Harness {
        adapter,
        sink,
        store,
        reconciler,
    }
}

/// Correlation store whose writes for one execution block until released
pub(crate) struct StallingStore {
    inner: Arc<InMemoryCorrelationStore>,
    stalled: Mutex<Option<ExecutionRef>>,
    pub entered: Notify,
    pub release: Notify,
}

impl StallingStore {
    pub(crate) fn new(inner: Arc<InMemoryCorrelationStore>) -> Self {
        Self {
            inner,
            stalled: Mutex::new(None),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    pub(crate) fn stall_writes_for(&self, execution: ExecutionRef) {
        *self.stalled.lock().unwrap() = Some(execution);
    }
}

#[async_trait]
impl CorrelationStore for StallingStore {
    async fn get(&self, execution: &ExecutionRef) -> Result<Option<CorrelationRecord>, StoreError> {
        self.inner.get(execution).await
    }

    async fn find_by_job(
        &self,
        provider: &ProviderId,
        job_key: &ExternalJobKey,
    ) -> Result<Option<ExecutionRef>, StoreError> {
        self.inner.find_by_job(provider, job_key).await
    }

    async fn put(&self, record: &CorrelationRecord) -> Result<(), StoreError> {
        let stall = self.stalled.lock().unwrap().as_ref() == Some(&record.correlation.execution);
        if stall {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.put(record).await
    }

    async fn remove(&self, execution: &ExecutionRef) -> Result<(), StoreError> {
        self.inner.remove(execution).await
    }

    async fn list(&self) -> Result<Vec<CorrelationRecord>, StoreError> {
        self.inner.list().await
    }
}

/// Harness whose reconciler writes through a [`StallingStore`]
pub(crate) fn stalling_harness(config: CompletionConfig) -> (Harness, Arc<StallingStore>) {
    let adapter = Arc::new(ScriptedAdapter::new("circleci"));
    let sink = Arc::new(RecordingSink::default());
    let store = Arc::new(InMemoryCorrelationStore::new());
    let stalling = Arc::new(StallingStore::new(store.clone()));
    let reconciler = CompletionReconciler::new(
        config,
        Arc::new(ProviderRegistry::new().with_adapter(adapter.clone())),
        sink.clone(),
        stalling.clone(),
    );
    let harness = Harness {
        adapter,
        sink,
        store,
        reconciler,
    };
    (harness, stalling)
}

pub(crate) fn circleci() -> ProviderId {
    ProviderId::new("circleci").unwrap()
}

pub(crate) fn job(key: &str) -> ExternalJobKey {
    ExternalJobKey::new(key).unwrap()
}

pub(crate) fn sub_job(id: &str) -> SubJobId {
    SubJobId::new(id).unwrap()
}

pub(crate) fn execution(id: &str) -> ExecutionRef {
    ExecutionRef::new(id).unwrap()
}
