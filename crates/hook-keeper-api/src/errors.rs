//! Error types for the HTTP service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use hook_keeper_core::IngressError;
use tracing::{error, warn};

/// Webhook handler errors with HTTP status code mapping
///
/// - `400 Bad Request`: malformed payloads; the provider should not retry
/// - `403 Forbidden`: missing or invalid signatures
/// - `404 Not Found`: unknown webhook; lets providers disable stale hooks
/// - `500 Internal Server Error`: secret lookup or dispatch failures; the
///   provider is expected to redeliver
///
/// Messages returned to clients never include secret material or internal
/// error detail for server-side failures.
#[derive(Debug, thiserror::Error)]
pub enum WebhookHandlerError {
    /// Failure reported by the ingress pipeline
    #[error("{0}")]
    Ingress(#[from] IngressError),

    /// Every subscriber was processed but at least one failed
    #[error("{message}")]
    Delivery { status: u16, message: String },
}

impl WebhookHandlerError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        let code = match self {
            Self::Ingress(e) => e.status_code(),
            Self::Delivery { status, .. } => *status,
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for WebhookHandlerError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = if status.is_server_error() {
            // Log detailed error server-side but return generic message to client
            error!(error = %self, status = %status, "Webhook processing failed");
            "Internal server error occurred. Please try again later.".to_string()
        } else {
            warn!(error = %self, status = %status, "Webhook rejected");
            self.to_string()
        };

        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        (status, Json(body)).into_response()
    }
}

/// Service-level errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to bind to address {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("Server failed: {message}")]
    ServerFailed { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration loading failed: {0}")]
    Load(#[from] config::ConfigError),
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod tests;
