//! Per-execution reconciliation actor.
//!
//! The actor owns its execution's [`CorrelationRecord`] and is the only task
//! that mutates it. Its loop waits on the command queue and on the poll
//! deadline; the deadline is only armed while the execution is open.

use super::{
    evaluate, Aggregate, CompletionConfig, CompletionError, CompletionOutcome, CorrelationRecord,
    CorrelationStore, JobCompletionState, JobStatus, Reconciliation, StatusVocabulary,
};
use crate::provider::{CancelOutcome, ProviderAdapter};
use crate::{EventSink, ExecutionRef, SubJobId, Timestamp};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

pub(crate) type ActorMap = Arc<RwLock<HashMap<ExecutionRef, mpsc::Sender<Command>>>>;

type Reply<T> = oneshot::Sender<Result<T, CompletionError>>;

/// Messages accepted by an execution actor
pub(crate) enum Command {
    Webhook {
        sub_job: SubJobId,
        raw_status: String,
        reply: Reply<Reconciliation>,
    },
    Poll {
        reply: Reply<Reconciliation>,
    },
    Cancel {
        reply: Reply<Reconciliation>,
    },
    Snapshot {
        reply: oneshot::Sender<JobCompletionState>,
    },
    Shutdown,
}

/// Collaborators shared by every actor
#[derive(Clone)]
pub(crate) struct ActorContext {
    pub config: CompletionConfig,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub sink: Arc<dyn EventSink>,
    pub store: Arc<dyn CorrelationStore>,
    pub vocabulary: StatusVocabulary,
    pub actors: ActorMap,
}

pub(crate) struct ExecutionActor {
    record: CorrelationRecord,
    ctx: ActorContext,
    rx: mpsc::Receiver<Command>,
    poll_interval: Duration,
    next_poll: Instant,
}

impl ExecutionActor {
    /// Spawn an actor for an open record and return its command sender
    pub(crate) fn spawn(record: CorrelationRecord, ctx: ActorContext) -> mpsc::Sender<Command> {
        let (tx, rx) = mpsc::channel(ctx.config.command_buffer.max(1));

        let poll_interval = record
            .correlation
            .poll_interval_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| ctx.config.poll_interval());

        let actor = Self {
            record,
            ctx,
            rx,
            poll_interval,
            next_poll: Instant::now() + poll_interval,
        };

        tokio::spawn(actor.run());
        tx
    }

    fn execution(&self) -> &ExecutionRef {
        &self.record.correlation.execution
    }

    async fn run(mut self) {
        debug!(
            execution = %self.execution(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "Reconciliation actor started"
        );

        while !self.record.state.terminal {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command).await,
                },
                _ = sleep_until(self.next_poll) => {
                    if let Err(e) = self.poll().await {
                        warn!(
                            execution = %self.execution(),
                            error = %e,
                            "Scheduled poll failed; retrying at next interval"
                        );
                    }
                    self.next_poll = Instant::now() + self.poll_interval;
                }
            }
        }

        // Inputs that raced the terminal transition see the latched state.
        self.rx.close();
        while let Some(command) = self.rx.recv().await {
            self.reply_closed(command);
        }

        let execution = self.execution().clone();
        let actors = self.ctx.actors.clone();
        drop(self);

        let mut actors = actors.write().await;
        if actors.get(&execution).is_some_and(|tx| tx.is_closed()) {
            actors.remove(&execution);
        }

        debug!(execution = %execution, "Reconciliation actor stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Webhook {
                sub_job,
                raw_status,
                reply,
            } => {
                let result = self.on_webhook(sub_job, &raw_status).await;
                let _ = reply.send(result);
            }
            Command::Poll { reply } => {
                let result = self.poll().await;
                self.next_poll = Instant::now() + self.poll_interval;
                let _ = reply.send(result);
            }
            Command::Cancel { reply } => {
                let result = self.cancel().await;
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.record.state.clone());
            }
            Command::Shutdown => {}
        }
    }

    fn reply_closed(&self, command: Command) {
        match command {
            Command::Webhook { reply, .. } | Command::Poll { reply } | Command::Cancel { reply } => {
                let result = if self.record.state.terminal {
                    Ok(Reconciliation::AlreadyTerminal)
                } else {
                    Err(CompletionError::ActorStopped {
                        execution: self.execution().clone(),
                    })
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.record.state.clone());
            }
            Command::Shutdown => {}
        }
    }

    async fn on_webhook(
        &mut self,
        sub_job: SubJobId,
        raw_status: &str,
    ) -> Result<Reconciliation, CompletionError> {
        if self.record.state.terminal {
            return Ok(Reconciliation::AlreadyTerminal);
        }

        let status = self.ctx.vocabulary.classify(raw_status);
        debug!(
            execution = %self.execution(),
            sub_job = %sub_job,
            raw_status = raw_status,
            status = %status,
            "Webhook status update"
        );

        self.record.state.sub_jobs.insert(sub_job, status);
        self.record.state.updated_at = Timestamp::now();
        self.settle().await
    }

    /// Fetch authoritative status for every sub-job and replace local state
    async fn poll(&mut self) -> Result<Reconciliation, CompletionError> {
        if self.record.state.terminal {
            return Ok(Reconciliation::AlreadyTerminal);
        }

        self.record.state.poll_attempts += 1;
        self.record.state.last_polled_at = Some(Timestamp::now());

        let known = self.record.state.sub_job_ids();
        let fetched = match self
            .ctx
            .adapter
            .fetch_job_status(&self.record.correlation.job_key, &known)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                if self.poll_ceiling_reached() {
                    self.finalize(CompletionOutcome::TimedOut).await;
                    return Ok(Reconciliation::Completed(CompletionOutcome::TimedOut));
                }
                self.persist().await;
                return Err(e.into());
            }
        };

        let sub_jobs: BTreeMap<SubJobId, JobStatus> = fetched
            .into_iter()
            .map(|s| {
                let status = self.ctx.vocabulary.classify(&s.raw_status);
                (s.sub_job_id, status)
            })
            .collect();

        debug!(
            execution = %self.execution(),
            attempt = self.record.state.poll_attempts,
            sub_jobs = sub_jobs.len(),
            "Polled job status"
        );

        self.record.state.sub_jobs = sub_jobs;
        self.record.state.updated_at = Timestamp::now();

        match self.settle().await? {
            Reconciliation::Pending if self.poll_ceiling_reached() => {
                warn!(
                    execution = %self.execution(),
                    attempts = self.record.state.poll_attempts,
                    "Poll ceiling reached without completion"
                );
                self.finalize(CompletionOutcome::TimedOut).await;
                Ok(Reconciliation::Completed(CompletionOutcome::TimedOut))
            }
            other => Ok(other),
        }
    }

    async fn cancel(&mut self) -> Result<Reconciliation, CompletionError> {
        if self.record.state.terminal {
            return Ok(Reconciliation::AlreadyTerminal);
        }

        match self
            .ctx
            .adapter
            .cancel_job(&self.record.correlation.job_key)
            .await?
        {
            CancelOutcome::Requested => {
                info!(execution = %self.execution(), "Cancellation requested");
                Ok(Reconciliation::Pending)
            }
            CancelOutcome::Confirmed => {
                info!(execution = %self.execution(), "Cancellation confirmed by provider");
                for status in self.record.state.sub_jobs.values_mut() {
                    if !status.is_terminal() {
                        *status = JobStatus::Canceled;
                    }
                }
                self.finalize(CompletionOutcome::Failed).await;
                Ok(Reconciliation::Completed(CompletionOutcome::Failed))
            }
        }
    }

    fn poll_ceiling_reached(&self) -> bool {
        self.ctx
            .config
            .max_poll_attempts
            .is_some_and(|max| self.record.state.poll_attempts >= max)
    }

    /// Re-evaluate the aggregate after an update and complete if decided
    async fn settle(&mut self) -> Result<Reconciliation, CompletionError> {
        match evaluate(&self.record.state.sub_jobs) {
            Aggregate::Inconclusive => {
                self.ctx.store.put(&self.record).await?;
                Ok(Reconciliation::Pending)
            }
            Aggregate::Succeeded => {
                self.finalize(CompletionOutcome::Succeeded).await;
                Ok(Reconciliation::Completed(CompletionOutcome::Succeeded))
            }
            Aggregate::Failed => {
                self.finalize(CompletionOutcome::Failed).await;
                Ok(Reconciliation::Completed(CompletionOutcome::Failed))
            }
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.ctx.store.put(&self.record).await {
            warn!(execution = %self.execution(), error = %e, "Failed to persist state");
        }
    }

    /// Latch, persist, then emit
    async fn finalize(&mut self, outcome: CompletionOutcome) {
        let now = Timestamp::now();
        self.record.state.terminal = true;
        self.record.state.outcome = Some(outcome);
        self.record.state.terminal_at = Some(now);
        self.record.state.updated_at = now;

        if let Err(e) = self.ctx.store.put(&self.record).await {
            // The in-memory latch still prevents a second emission.
            error!(
                execution = %self.execution(),
                error = %e,
                "Failed to persist terminal state"
            );
        }

        info!(
            execution = %self.execution(),
            job_key = %self.record.correlation.job_key,
            outcome = %outcome,
            "Execution reached terminal state"
        );

        self.emit(outcome).await;
    }

    async fn emit(&self, outcome: CompletionOutcome) {
        let correlation = &self.record.correlation;
        let payload = json!({
            "execution": correlation.execution,
            "provider": correlation.provider,
            "job_key": correlation.job_key,
            "outcome": outcome,
            "sub_jobs": self.record.state.sub_jobs,
        });

        let policy = &self.ctx.config.emit_retry;
        let attempts = policy.max_attempts.max(1);

        for attempt in 0..attempts {
            let delay = policy.calculate_delay(attempt);
            if !delay.is_zero() {
                sleep(delay).await;
            }

            match self
                .ctx
                .sink
                .emit(&correlation.channel, outcome.event_type(), payload.clone())
                .await
            {
                Ok(()) => return,
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    warn!(
                        execution = %correlation.execution,
                        attempt = attempt + 1,
                        error = %e,
                        "Emission failed, retrying"
                    );
                }
                Err(e) => {
                    error!(
                        execution = %correlation.execution,
                        error = %e,
                        "Emission failed permanently; outcome recorded but not delivered"
                    );
                    return;
                }
            }
        }
    }
}
