//! Front-end for the per-execution reconciliation actors.

use super::actor::{ActorContext, ActorMap, Command, ExecutionActor};
use super::{
    CompletionConfig, CompletionError, CorrelationRecord, CorrelationStore, DispatchRequest,
    JobCompletionState, JobCorrelation, Reconciliation, StatusVocabulary,
};
use crate::provider::ProviderRegistry;
use crate::subscription::KeyedLocks;
use crate::{EventSink, ExecutionRef, ExternalJobKey, ProviderId, SubJobId, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, instrument};

/// Reconciles terminal outcomes of dispatched remote jobs
///
/// Cheap to clone; clones share the same actors and stores.
///
/// # Examples
///
/// ```rust,no_run
/// use hook_keeper_core::completion::{CompletionConfig, CompletionReconciler, DispatchRequest};
/// use hook_keeper_core::adapters::InMemoryCorrelationStore;
/// use hook_keeper_core::{EventSink, ExecutionRef, ExternalJobKey, ProviderId, ProviderRegistry};
/// use std::sync::Arc;
/// # async fn example(providers: ProviderRegistry, sink: Arc<dyn EventSink>) -> Result<(), Box<dyn std::error::Error>> {
/// let reconciler = CompletionReconciler::new(
///     CompletionConfig::default(),
///     Arc::new(providers),
///     sink,
///     Arc::new(InMemoryCorrelationStore::new()),
/// );
///
/// let execution = ExecutionRef::generate();
/// reconciler
///     .on_dispatch(DispatchRequest::new(
///         execution,
///         ProviderId::new("circleci")?,
///         ExternalJobKey::new("pipeline-42")?,
///         "default",
///     ))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CompletionReconciler {
    config: CompletionConfig,
    providers: Arc<ProviderRegistry>,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn CorrelationStore>,
    default_vocabulary: StatusVocabulary,
    vocabularies: HashMap<ProviderId, StatusVocabulary>,
    actors: ActorMap,
    execution_locks: Arc<KeyedLocks<ExecutionRef>>,
    job_locks: Arc<KeyedLocks<(ProviderId, ExternalJobKey)>>,
}

impl CompletionReconciler {
    /// Create a reconciler using the default status vocabulary for every provider
    pub fn new(
        config: CompletionConfig,
        providers: Arc<ProviderRegistry>,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn CorrelationStore>,
    ) -> Self {
        Self {
            config,
            providers,
            sink,
            store,
            default_vocabulary: StatusVocabulary::default(),
            vocabularies: HashMap::new(),
            actors: Arc::new(RwLock::new(HashMap::new())),
            execution_locks: Arc::new(KeyedLocks::new()),
            job_locks: Arc::new(KeyedLocks::new()),
        }
    }

    /// Extend the default vocabulary for one provider
    pub fn with_vocabulary(mut self, provider: ProviderId, vocabulary: StatusVocabulary) -> Self {
        let merged = StatusVocabulary::default().extended_with(&vocabulary);
        self.vocabularies.insert(provider, merged);
        self
    }

    fn vocabulary_for(&self, provider: &ProviderId) -> StatusVocabulary {
        self.vocabularies
            .get(provider)
            .cloned()
            .unwrap_or_else(|| self.default_vocabulary.clone())
    }

    fn context_for(&self, provider: &ProviderId) -> Result<ActorContext, CompletionError> {
        let adapter =
            self.providers
                .get(provider)
                .ok_or_else(|| CompletionError::UnknownProvider {
                    provider: provider.clone(),
                })?;

        Ok(ActorContext {
            config: self.config.clone(),
            adapter,
            sink: self.sink.clone(),
            store: self.store.clone(),
            vocabulary: self.vocabulary_for(provider),
            actors: self.actors.clone(),
        })
    }

    /// Record the correlation for a job about to be dispatched and start polling
    ///
    /// Call this before the dispatch request goes out so a fast webhook finds
    /// the correlation. If the dispatch then fails, call [`Self::abandon`].
    ///
    /// # Errors
    ///
    /// - [`CompletionError::DuplicateDispatch`] if the execution is already tracked
    /// - [`CompletionError::JobKeyInUse`] if another open execution tracks the job
    /// - [`CompletionError::UnknownProvider`] for an unregistered provider
    #[instrument(skip_all, fields(execution = %request.execution, provider = %request.provider, job_key = %request.job_key))]
    pub async fn on_dispatch(&self, request: DispatchRequest) -> Result<(), CompletionError> {
        let ctx = self.context_for(&request.provider)?;

        // Lock order: execution, then job. Webhooks and polls never take these.
        let _execution_guard = self.execution_locks.acquire(&request.execution).await;
        let _job_guard = self
            .job_locks
            .acquire(&(request.provider.clone(), request.job_key.clone()))
            .await;

        let tracked = self.actors.read().await.contains_key(&request.execution);
        if tracked || self.store.get(&request.execution).await?.is_some() {
            return Err(CompletionError::DuplicateDispatch {
                execution: request.execution,
            });
        }

        if let Some(current) = self
            .store
            .find_by_job(&request.provider, &request.job_key)
            .await?
        {
            let open = self
                .store
                .get(&current)
                .await?
                .is_some_and(|record| !record.state.terminal);
            if open {
                return Err(CompletionError::JobKeyInUse {
                    provider: request.provider,
                    job_key: request.job_key,
                    execution: current,
                });
            }
            debug!(previous = %current, "Job key reused after terminal execution");
        }

        let record = CorrelationRecord {
            correlation: JobCorrelation {
                execution: request.execution.clone(),
                provider: request.provider,
                job_key: request.job_key,
                channel: request.channel,
                poll_interval_seconds: request.poll_interval.map(|d| d.as_secs().max(1)),
                created_at: Timestamp::now(),
            },
            state: JobCompletionState::new(request.sub_jobs),
        };

        self.store.put(&record).await?;

        let tx = ExecutionActor::spawn(record, ctx);
        self.actors.write().await.insert(request.execution, tx);

        info!("Tracking dispatched job");
        Ok(())
    }

    /// Apply a webhook-reported sub-job status
    ///
    /// Unknown jobs are not an error: they were not started by this system.
    #[instrument(skip_all, fields(provider = %provider, job_key = %job_key, sub_job = %sub_job))]
    pub async fn on_webhook_event(
        &self,
        provider: &ProviderId,
        job_key: &ExternalJobKey,
        sub_job: SubJobId,
        raw_status: &str,
    ) -> Result<Reconciliation, CompletionError> {
        let Some(execution) = self.store.find_by_job(provider, job_key).await? else {
            debug!("No correlation for job; ignoring");
            return Ok(Reconciliation::NotOurs);
        };

        let raw_status = raw_status.to_string();
        self.request(&execution, |reply| Command::Webhook {
            sub_job,
            raw_status,
            reply,
        })
        .await
    }

    /// Poll the provider now instead of waiting for the timer
    ///
    /// # Errors
    ///
    /// Provider failures are returned to the caller; the scheduled poll keeps
    /// running regardless.
    pub async fn on_poll_tick(
        &self,
        execution: &ExecutionRef,
    ) -> Result<Reconciliation, CompletionError> {
        self.request(execution, |reply| Command::Poll { reply })
            .await
    }

    /// Ask the provider to cancel the remote job
    ///
    /// Completes the execution only when the provider confirms synchronously;
    /// otherwise the provider's own completion signal still decides.
    pub async fn cancel(&self, execution: &ExecutionRef) -> Result<Reconciliation, CompletionError> {
        self.request(execution, |reply| Command::Cancel { reply })
            .await
    }

    /// Forget an execution whose dispatch failed
    #[instrument(skip_all, fields(execution = %execution))]
    pub async fn abandon(&self, execution: &ExecutionRef) -> Result<(), CompletionError> {
        let actor = self.actors.write().await.remove(execution);
        if let Some(tx) = actor {
            // Wait for the actor to stop so it cannot write the record back.
            if tx.send(Command::Shutdown).await.is_ok() {
                tx.closed().await;
            }
        }
        self.store.remove(execution).await?;
        info!("Abandoned execution");
        Ok(())
    }

    /// Current state of an execution, if tracked
    pub async fn snapshot(
        &self,
        execution: &ExecutionRef,
    ) -> Result<Option<JobCompletionState>, CompletionError> {
        let tx = self.actors.read().await.get(execution).cloned();

        if let Some(tx) = tx {
            let (reply, rx) = oneshot::channel();
            if tx.send(Command::Snapshot { reply }).await.is_ok() {
                if let Ok(state) = rx.await {
                    return Ok(Some(state));
                }
            }
        }

        Ok(self.store.get(execution).await?.map(|record| record.state))
    }

    /// Restart actors for open executions found in the store
    ///
    /// Returns the number of actors started.
    pub async fn resume_pending(&self) -> Result<usize, CompletionError> {
        let records = self.store.list().await?;
        let mut resumed = 0;

        for record in records {
            if record.state.terminal {
                continue;
            }
            let ctx = self.context_for(&record.correlation.provider)?;

            let mut actors = self.actors.write().await;
            let execution = record.correlation.execution.clone();
            if actors.get(&execution).is_some_and(|tx| !tx.is_closed()) {
                continue;
            }
            actors.insert(execution, ExecutionActor::spawn(record, ctx));
            resumed += 1;
        }

        info!(resumed = resumed, "Resumed pending reconciliations");
        Ok(resumed)
    }

    /// Remove terminal records that completed more than `older_than` ago
    ///
    /// Returns the number of records removed.
    pub async fn prune_terminal(&self, older_than: Duration) -> Result<usize, CompletionError> {
        let cutoff = Timestamp::now().subtract_duration(older_than);
        let mut pruned = 0;

        for record in self.store.list().await? {
            let expired = record.state.terminal
                && record
                    .state
                    .terminal_at
                    .is_some_and(|completed| completed <= cutoff);
            if expired {
                self.store.remove(&record.correlation.execution).await?;
                pruned += 1;
            }
        }

        if pruned > 0 {
            info!(pruned = pruned, "Pruned terminal correlations");
        }
        Ok(pruned)
    }

    /// Number of live reconciliation actors
    pub async fn active_executions(&self) -> usize {
        self.actors
            .read()
            .await
            .values()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Send a command to the execution's actor, starting one if needed
    async fn request<F>(
        &self,
        execution: &ExecutionRef,
        command: F,
    ) -> Result<Reconciliation, CompletionError>
    where
        F: FnOnce(oneshot::Sender<Result<Reconciliation, CompletionError>>) -> Command,
    {
        let Some(tx) = self.actor_for(execution).await? else {
            return Ok(Reconciliation::AlreadyTerminal);
        };

        let (reply, rx) = oneshot::channel();
        if tx.send(command(reply)).await.is_err() {
            return self.closed_outcome(execution).await;
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => self.closed_outcome(execution).await,
        }
    }

    /// Live sender for an open execution; `None` if it already completed
    async fn actor_for(
        &self,
        execution: &ExecutionRef,
    ) -> Result<Option<mpsc::Sender<Command>>, CompletionError> {
        if let Some(tx) = self.actors.read().await.get(execution) {
            if !tx.is_closed() {
                return Ok(Some(tx.clone()));
            }
        }

        let Some(record) = self.store.get(execution).await? else {
            return Err(CompletionError::UnknownExecution {
                execution: execution.clone(),
            });
        };

        let mut actors = self.actors.write().await;
        // Another caller may have started the actor while the store was read.
        if let Some(tx) = actors.get(execution) {
            if !tx.is_closed() {
                return Ok(Some(tx.clone()));
            }
        }

        if record.state.terminal {
            actors.remove(execution);
            return Ok(None);
        }

        let ctx = self.context_for(&record.correlation.provider)?;
        let tx = ExecutionActor::spawn(record, ctx);
        actors.insert(execution.clone(), tx.clone());
        Ok(Some(tx))
    }

    /// Outcome for a command whose actor stopped before replying
    async fn closed_outcome(
        &self,
        execution: &ExecutionRef,
    ) -> Result<Reconciliation, CompletionError> {
        match self.store.get(execution).await? {
            Some(record) if record.state.terminal => Ok(Reconciliation::AlreadyTerminal),
            Some(_) => Err(CompletionError::ActorStopped {
                execution: execution.clone(),
            }),
            None => Err(CompletionError::UnknownExecution {
                execution: execution.clone(),
            }),
        }
    }
}

impl std::fmt::Debug for CompletionReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionReconciler")
            .field("config", &self.config)
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod tests;
