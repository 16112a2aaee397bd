//! Common test utilities for hook-keeper integration tests
//!
//! This module provides:
//! - A fake provider adapter with call counters and scripted job statuses
//! - A recording event sink and a channel-routing sink
//! - [`TestWorld`], wiring reconcilers, the ingress router and the axum app

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{body::Body, http::Request, Router};
use hook_keeper_api::{create_router, AppState, ServiceConfig};
use hook_keeper_core::adapters::{InMemoryCorrelationStore, InMemorySubscriptionStore};
use hook_keeper_core::completion::{CompletionEventRouter, CompletionFieldPaths, CorrelationStore};
use hook_keeper_core::ingress::{
    EventFilter, IngressPipeline, IngressRegistry, IngressSubscription, ProviderProfile,
};
use hook_keeper_core::provider::{CancelOutcome, SubJobStatus, WebhookRegistration};
use hook_keeper_core::signature::sign_hmac_sha256;
use hook_keeper_core::subscription::SubscriptionStore;
use hook_keeper_core::{
    AttachRequest, CompletionConfig, CompletionReconciler, EventSet, EventSink, ExternalJobKey,
    ExternalWebhookId, IngressRouter, PhysicalWebhook, ProviderAdapter, ProviderError, ProviderId,
    ProviderRegistry, Scope, SinkError, SubJobId, SubscriberId, SubscriptionConfig,
    SubscriptionReconciler,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Fake provider
// ============================================================================

/// Provider adapter that records webhook calls and serves scripted job statuses
pub struct FakeProvider {
    provider: ProviderId,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
    pub deletes: AtomicUsize,
    pub polls: AtomicUsize,
    registered_events: Mutex<Vec<EventSet>>,
    statuses: Mutex<Vec<SubJobStatus>>,
}

impl FakeProvider {
    pub fn new(provider: &str) -> Self {
        Self {
            provider: ProviderId::new(provider).unwrap(),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            registered_events: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn last_registered_events(&self) -> Option<EventSet> {
        self.registered_events.lock().unwrap().last().cloned()
    }

    pub fn set_statuses(&self, statuses: &[(&str, &str)]) {
        *self.statuses.lock().unwrap() = statuses
            .iter()
            .map(|(id, status)| SubJobStatus::new(SubJobId::new(*id).unwrap(), *status))
            .collect();
    }
}

#[async_trait]
impl ProviderAdapter for FakeProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.provider
    }

    async fn create_or_update_webhook(
        &self,
        registration: &WebhookRegistration,
    ) -> Result<ExternalWebhookId, ProviderError> {
        self.registered_events
            .lock()
            .unwrap()
            .push(registration.events.clone());

        match &registration.existing {
            Some(id) => {
                self.updates.fetch_add(1, Ordering::SeqCst);
                Ok(id.clone())
            }
            None => {
                let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(ExternalWebhookId::new(format!("{}-hook-{n}", self.provider)).unwrap())
            }
        }
    }

    async fn delete_webhook(&self, _external_id: &ExternalWebhookId) -> Result<(), ProviderError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_job_status(
        &self,
        _job_key: &ExternalJobKey,
        _known_sub_jobs: &[SubJobId],
    ) -> Result<Vec<SubJobStatus>, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self.statuses.lock().unwrap().clone())
    }

    async fn cancel_job(&self, _job_key: &ExternalJobKey) -> Result<CancelOutcome, ProviderError> {
        Ok(CancelOutcome::Requested)
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// One emitted event
#[derive(Debug, Clone)]
pub struct Emitted {
    pub channel: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Sink recording every emission
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Emitted>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Emitted> {
        self.events.lock().unwrap().clone()
    }

    pub fn on_channel(&self, channel: &str) -> Vec<Emitted> {
        self.events()
            .into_iter()
            .filter(|e| e.channel == channel)
            .collect()
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
        self.events.lock().unwrap().push(Emitted {
            channel: channel.to_string(),
            event_type: event_type.to_string(),
            payload,
        });
        Ok(())
    }
}

/// Sink forwarding selected channels to dedicated sinks
pub struct ChannelSink {
    routes: Mutex<HashMap<String, Arc<dyn EventSink>>>,
    fallback: Arc<dyn EventSink>,
}

impl ChannelSink {
    pub fn new(fallback: Arc<dyn EventSink>) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            fallback,
        }
    }

    pub fn route(&self, channel: &str, sink: Arc<dyn EventSink>) {
        self.routes
            .lock()
            .unwrap()
            .insert(channel.to_string(), sink);
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(
        &self,
        channel: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), SinkError> {
        let sink = self
            .routes
            .lock()
            .unwrap()
            .get(channel)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());
        sink.emit(channel, event_type, payload).await
    }
}

// ============================================================================
// Test world
// ============================================================================

pub const COMPLETION_CHANNEL: &str = "completion";

/// Fully wired service with in-memory stores
pub struct TestWorld {
    pub provider: Arc<FakeProvider>,
    pub subscriptions: Arc<SubscriptionReconciler>,
    pub subscription_store: Arc<dyn SubscriptionStore>,
    pub completion: CompletionReconciler,
    pub ingress: Arc<IngressRouter>,
    pub sink: Arc<RecordingSink>,
    pub config: ServiceConfig,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::with_stores(
            Arc::new(InMemorySubscriptionStore::new()),
            Arc::new(InMemoryCorrelationStore::new()),
            CompletionConfig::default(),
        )
    }

    pub fn with_stores(
        subscription_store: Arc<dyn SubscriptionStore>,
        correlation_store: Arc<dyn CorrelationStore>,
        completion_config: CompletionConfig,
    ) -> Self {
        let provider = Arc::new(FakeProvider::new("circleci"));
        let providers = Arc::new(
            ProviderRegistry::new().with_adapter(provider.clone() as Arc<dyn ProviderAdapter>),
        );

        let mut config = ServiceConfig::default();
        config.subscription = SubscriptionConfig {
            callback_base_url: "https://hooks.example.com/webhooks".to_string(),
        };
        config.completion = completion_config.clone();
        config.providers = vec![ProviderProfile::circleci()];

        let subscriptions = Arc::new(SubscriptionReconciler::new(
            config.subscription.clone(),
            providers.clone(),
            subscription_store.clone(),
        ));

        let sink = Arc::new(RecordingSink::default());
        let completion = CompletionReconciler::new(
            completion_config,
            providers,
            sink.clone(),
            correlation_store,
        );

        let channels = Arc::new(ChannelSink::new(sink.clone()));
        channels.route(
            COMPLETION_CHANNEL,
            Arc::new(
                CompletionEventRouter::new(completion.clone())
                    .with_route(ProviderId::new("circleci").unwrap(), CompletionFieldPaths::circleci()),
            ),
        );

        let pipeline = IngressPipeline::new(subscriptions.clone(), channels);
        let ingress = Arc::new(IngressRouter::new(IngressRegistry::new(), pipeline));

        Self {
            provider,
            subscriptions,
            subscription_store,
            completion,
            ingress,
            sink,
            config,
        }
    }

    pub fn app(&self) -> Router {
        create_router(AppState::new(self.config.clone(), self.ingress.clone()))
    }

    /// Attach a subscriber and register its ingress subscription
    pub async fn subscribe(&self, subscriber: &str, events: &[&str], channel: &str) -> PhysicalWebhook {
        let events: EventSet = events.iter().copied().collect();
        let webhook = self
            .subscriptions
            .attach(AttachRequest::new(
                ProviderId::new("circleci").unwrap(),
                scope(),
                SubscriberId::new(subscriber).unwrap(),
                events.clone(),
            ))
            .await
            .unwrap();

        self.ingress
            .registry()
            .register(IngressSubscription {
                subscriber_id: SubscriberId::new(subscriber).unwrap(),
                webhook_id: webhook.webhook_id,
                scope: scope(),
                profile: Arc::new(ProviderProfile::circleci()),
                filter: EventFilter::for_events(events),
                channel: channel.to_string(),
                resource_kinds: EventSet::new(),
            })
            .await;

        webhook
    }

    /// Detach a subscriber and drop its ingress subscription
    pub async fn unsubscribe(&self, webhook: &PhysicalWebhook, subscriber: &str) {
        let subscriber = SubscriberId::new(subscriber).unwrap();
        self.subscriptions
            .detach(&webhook.provider, &webhook.scope, &subscriber)
            .await
            .unwrap();
        self.ingress
            .registry()
            .unregister(&webhook.webhook_id, &subscriber)
            .await;
    }
}

pub fn scope() -> Scope {
    Scope::new("gh/acme/widgets").unwrap()
}

/// Build a CircleCI delivery signed with the webhook's secret
pub fn circleci_delivery(
    webhook: &PhysicalWebhook,
    event_type: &str,
    payload: &serde_json::Value,
) -> Request<Body> {
    let body = serde_json::to_vec(payload).unwrap();
    let signature = format!("v1={}", sign_hmac_sha256(&webhook.secret, &body));

    Request::builder()
        .method("POST")
        .uri(format!("/webhooks/circleci/{}", webhook.webhook_id))
        .header("content-type", "application/json")
        .header("Circleci-Event-Type", event_type)
        .header("Circleci-Signature", signature)
        .body(Body::from(body))
        .unwrap()
}

/// CircleCI `workflow-completed` payload
pub fn workflow_completed(pipeline: &str, workflow: &str, status: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "workflow-completed",
        "pipeline": { "id": pipeline, "number": 7 },
        "workflow": { "id": workflow, "name": "build-and-test", "status": status },
        "project": { "slug": "gh/acme/widgets" }
    })
}

pub async fn response_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
