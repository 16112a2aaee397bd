//! Feeds normalized provider events into the completion reconciler.
//!
//! Registered as the [`EventSink`] of completion-tracking ingress
//! subscriptions: each event is mapped to `(job key, sub-job, raw status)`
//! through per-provider JSON paths and applied with
//! [`CompletionReconciler::on_webhook_event`].

use super::{CompletionReconciler, Reconciliation};
use crate::ingress::{resolve_json_string, NormalizedEvent};
use crate::{EventSet, EventSink, ExternalJobKey, ProviderId, SinkError, SubJobId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// JSON paths locating completion fields in a provider's payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionFieldPaths {
    /// Path of the remote job key (e.g. `pipeline.id`)
    pub job_key: String,

    /// Path of the sub-job ID (e.g. `workflow.id`)
    pub sub_job: String,

    /// Path of the raw status (e.g. `workflow.status`)
    pub status: String,

    /// Event types carrying completion data; empty accepts all
    #[serde(default)]
    pub event_types: EventSet,
}

impl CompletionFieldPaths {
    /// CircleCI `workflow-completed` deliveries
    pub fn circleci() -> Self {
        Self {
            job_key: "pipeline.id".to_string(),
            sub_job: "workflow.id".to_string(),
            status: "workflow.status".to_string(),
            event_types: ["workflow-completed"].into_iter().collect(),
        }
    }
}

/// [`EventSink`] applying normalized events to a [`CompletionReconciler`]
#[derive(Debug, Clone)]
pub struct CompletionEventRouter {
    reconciler: CompletionReconciler,
    routes: HashMap<ProviderId, CompletionFieldPaths>,
}

impl CompletionEventRouter {
    pub fn new(reconciler: CompletionReconciler) -> Self {
        Self {
            reconciler,
            routes: HashMap::new(),
        }
    }

    /// Route a provider's events using `paths`
    pub fn with_route(mut self, provider: ProviderId, paths: CompletionFieldPaths) -> Self {
        self.routes.insert(provider, paths);
        self
    }

    /// Apply one normalized event; `None` when the event carries no completion data
    ///
    /// # Errors
    ///
    /// [`SinkError::Rejected`] for events missing a mapped field,
    /// [`SinkError::Unavailable`] for transient reconciler failures.
    pub async fn route(&self, event: &NormalizedEvent) -> Result<Option<Reconciliation>, SinkError> {
        let Some(paths) = self.routes.get(&event.provider) else {
            debug!(provider = %event.provider, "No completion route for provider");
            return Ok(None);
        };

        if !paths.event_types.is_empty() && !paths.event_types.contains(&event.event_type) {
            return Ok(None);
        }

        let field = |path: &str| {
            resolve_json_string(&event.payload, path).ok_or_else(|| SinkError::Rejected {
                message: format!("event {} has no value at '{}'", event.event_id, path),
            })
        };

        let job_key = ExternalJobKey::new(field(&paths.job_key)?).map_err(rejected)?;
        let sub_job = SubJobId::new(field(&paths.sub_job)?).map_err(rejected)?;
        let status = field(&paths.status)?;

        let result = self
            .reconciler
            .on_webhook_event(&event.provider, &job_key, sub_job, &status)
            .await;

        match result {
            Ok(reconciliation) => Ok(Some(reconciliation)),
            Err(e) if e.is_transient() => {
                warn!(event_id = %event.event_id, error = %e, "Reconciliation failed, retry expected");
                Err(SinkError::Unavailable {
                    message: e.to_string(),
                })
            }
            Err(e) => Err(rejected(e)),
        }
    }
}

fn rejected(e: impl std::fmt::Display) -> SinkError {
    SinkError::Rejected {
        message: e.to_string(),
    }
}

#[async_trait]
impl EventSink for CompletionEventRouter {
    async fn emit(
        &self,
        _channel: &str,
        _event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), SinkError> {
        let event: NormalizedEvent = serde_json::from_value(payload).map_err(rejected)?;
        self.route(&event).await.map(|_| ())
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
