//! Configuration types for the HTTP service

use crate::errors::ConfigError;
use hook_keeper_core::completion::CompletionConfig;
use hook_keeper_core::ingress::ProviderProfile;
use hook_keeper_core::subscription::SubscriptionConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::info;

/// Environment variable naming an extra configuration file
pub const CONFIG_FILE_ENV: &str = "HOOK_KEEPER_CONFIG_FILE";

/// Prefix of configuration environment variables (`HK__SERVER__PORT=9090`)
pub const ENV_PREFIX: &str = "HK";

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Webhook registration settings
    pub subscription: SubscriptionConfig,

    /// Completion reconciliation settings
    pub completion: CompletionConfig,

    /// Delivery formats of the supported providers
    pub providers: Vec<ProviderProfile>,

    /// Directory for the filesystem stores; in-memory stores when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl ServiceConfig {
    /// Load configuration from files and the environment
    ///
    /// Sources, later overriding earlier:
    /// 1. `config/service.yaml` (optional)
    /// 2. The file named by `HOOK_KEEPER_CONFIG_FILE` (required when set)
    /// 3. `HK__`-prefixed environment variables, `__` between path segments
    ///
    /// # Errors
    ///
    /// Returns an error for unreadable or malformed sources and for
    /// configurations rejected by [`Self::validate`].
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var(CONFIG_FILE_ENV)
            .ok()
            .filter(|path| !path.is_empty());
        Self::load_from(explicit.as_deref())
    }

    /// Load configuration with an explicit override file instead of the env lookup
    pub fn load_from(explicit_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(
            config::File::with_name("config/service")
                .required(false)
                .format(config::FileFormat::Yaml),
        );

        if let Some(path) = explicit_path {
            info!(path = %path, "Loading configuration from explicit path");
            builder = builder.add_source(
                config::File::with_name(path)
                    .required(true)
                    .format(config::FileFormat::Yaml),
            );
        }

        let service_config: ServiceConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        service_config.validate()?;
        Ok(service_config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid {
                message: "server.port must be non-zero".to_string(),
            });
        }

        if self.server.max_body_size == 0 {
            return Err(ConfigError::Invalid {
                message: "server.max_body_size must be non-zero".to_string(),
            });
        }

        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            return Err(ConfigError::Invalid {
                message: format!("logging.level '{}' is not a valid filter", self.logging.level),
            });
        }

        let base = &self.subscription.callback_base_url;
        if !(base.starts_with("https://") || base.starts_with("http://")) {
            return Err(ConfigError::Invalid {
                message: format!("subscription.callback_base_url '{}' must be an http(s) URL", base),
            });
        }

        if self.completion.poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                message: "completion.poll_interval_seconds must be non-zero".to_string(),
            });
        }

        if self.completion.max_poll_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                message: "completion.max_poll_attempts must be at least 1 when set".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for profile in &self.providers {
            if !seen.insert(profile.provider.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("provider '{}' is configured more than once", profile.provider),
                });
            }
        }

        Ok(())
    }

    /// Profile configured for a provider, if any
    pub fn provider_profile(&self, provider: &str) -> Option<&ProviderProfile> {
        self.providers
            .iter()
            .find(|profile| profile.provider.as_str() == provider)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,

    /// Maximum request size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_seconds: 30,
            max_body_size: 5 * 1024 * 1024, // 5MB
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
