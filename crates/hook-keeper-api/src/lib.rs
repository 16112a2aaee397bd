//! # Hook-Keeper HTTP Service
//!
//! HTTP surface for inbound provider webhooks.
//!
//! This library provides:
//! - The webhook endpoint `POST /webhooks/{provider}/{webhook_id}`, backed by
//!   an [`IngressRouter`]
//! - A health check endpoint
//! - Layered service configuration and tracing initialisation
//!
//! The hosting process owns the subscription and completion reconcilers and
//! registers ingress subscriptions on the shared router.

pub mod config;
pub mod errors;
pub mod responses;

pub use crate::config::{LoggingConfig, ServerConfig, ServiceConfig};
pub use crate::errors::{ConfigError, ServiceError, WebhookHandlerError};
pub use crate::responses::{HealthResponse, WebhookResponse};

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::HeaderMap,
    middleware,
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use hook_keeper_core::IngressRouter;
use std::{collections::HashMap, future::IntoFuture, sync::Arc, time::Duration};
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// ============================================================================
// Application State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration for the service
    pub config: ServiceConfig,

    /// Fan-out of deliveries to ingress subscriptions
    pub router: Arc<IngressRouter>,
}

impl AppState {
    /// Create new application state
    pub fn new(config: ServiceConfig, router: Arc<IngressRouter>) -> Self {
        Self { config, router }
    }
}

// ============================================================================
// Observability
// ============================================================================

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `logging.level`.
///
/// # Errors
///
/// Fails for an invalid filter or when a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_format {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    Ok(())
}

// ============================================================================
// HTTP Server
// ============================================================================

/// Create HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let max_body_size = state.config.server.max_body_size;

    Router::new()
        .route("/webhooks/{provider}/{webhook_id}", post(handle_webhook))
        .route("/health", get(handle_health_check))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(request_logging_middleware))
                .layer(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(max_body_size))
                .into_inner(),
        )
        .with_state(state)
}

/// Start HTTP server and serve until SIGINT or SIGTERM
///
/// In-flight requests get `shutdown_timeout_seconds` to finish once a
/// signal arrives.
pub async fn start_server(state: AppState) -> Result<(), ServiceError> {
    let address = format!("{}:{}", state.config.server.host, state.config.server.port);
    let shutdown_timeout = Duration::from_secs(state.config.server.shutdown_timeout_seconds);

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| ServiceError::BindFailed {
            address: address.clone(),
            message: e.to_string(),
        })?;

    info!(address = %address, "Starting HTTP server");

    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(());
        })
        .into_future();

    tokio::select! {
        result = server => result.map_err(|e| ServiceError::ServerFailed {
            message: e.to_string(),
        })?,
        _ = async {
            if signalled_rx.await.is_ok() {
                tokio::time::sleep(shutdown_timeout).await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            warn!(timeout_secs = shutdown_timeout.as_secs(), "Shutdown timed out; dropping in-flight requests");
        }
    }

    info!("HTTP server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

// ============================================================================
// Handlers
// ============================================================================

/// Handle a provider webhook delivery
///
/// Responds 200 only when every attached subscriber accepted or ignored the
/// delivery; otherwise the most severe per-subscriber status is returned.
#[instrument(skip(state, headers, body), fields(body_size = body.len()))]
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path((provider, webhook_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookHandlerError> {
    let header_map = lowercase_headers(&headers);

    let report = state
        .router
        .deliver(&provider, &webhook_id, &header_map, &body)
        .await?;

    let status = report.status_code();
    if status >= 300 {
        return Err(WebhookHandlerError::Delivery {
            status,
            message: report
                .first_error()
                .unwrap_or_else(|| "delivery failed".to_string()),
        });
    }

    info!(
        dispatched = report.dispatched(),
        ignored = report.ignored(),
        "Webhook accepted"
    );
    Ok(Json(WebhookResponse::accepted(
        report.dispatched(),
        report.ignored(),
    )))
}

/// Basic health check endpoint
async fn handle_health_check() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

/// Header map with lowercased names; non-UTF-8 values become empty
pub fn lowercase_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_lowercase(),
                v.to_str().unwrap_or("").to_string(),
            )
        })
        .collect()
}

// ============================================================================
// Middleware
// ============================================================================

/// Request logging with correlation IDs
///
/// Reuses an inbound `x-correlation-id` or generates one, and echoes it on
/// the response.
async fn request_logging_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let correlation_id = request
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let path = request.uri().path().to_string();
    let start = std::time::Instant::now();

    let mut response = next.run(request).await;

    if let Ok(value) = correlation_id.parse() {
        response.headers_mut().insert("x-correlation-id", value);
    }

    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;
    if status >= 500 {
        warn!(correlation_id = %correlation_id, path = %path, status, duration_ms, "Request failed");
    } else {
        debug!(correlation_id = %correlation_id, path = %path, status, duration_ms, "Request completed");
    }

    response
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
