//! Server configuration, supplied at startup and immutable for the
//! process lifetime. Nothing in the request core is hardcoded.

use std::time::Duration;

use thiserror::Error;

/// Default maximum JSON body size: 1 MiB.
pub const DEFAULT_MAX_BODY_SIZE: usize = 1_048_576;

/// Idle timeout applied while waiting for request headers.
pub const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration errors, fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No API key and fail-open was not opted into.
    #[error("no API key configured; set an API key or pass --allow-unconfigured to fail open")]
    MissingApiKey,

    /// Rate-limit window must be positive.
    #[error("rate-limit window must be greater than zero")]
    ZeroWindow,

    /// Rate-limit quota must be positive.
    #[error("rate-limit quota must be greater than zero")]
    ZeroQuota,
}

/// Connection-dispatcher level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum JSON request body size in bytes.
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// API-key authentication and rate limiting settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// The configured API key. `None` means unconfigured.
    pub api_key: Option<String>,

    /// Header the key is read from before falling back to
    /// `Authorization`.
    pub header_name: String,

    /// Opt into fail-open: run without a configured key, allowing all
    /// requests. Off by default; without it a missing key is a fatal
    /// startup error.
    pub allow_unconfigured: bool,

    /// Whether the fixed-window limiter runs at all.
    pub rate_limit_enabled: bool,

    /// Window duration.
    pub window: Duration,

    /// Maximum requests per fingerprint per window.
    pub max_requests: u32,

    /// Path prefixes that bypass authentication entirely.
    pub public_prefixes: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            header_name: "x-api-key".to_string(),
            allow_unconfigured: false,
            rate_limit_enabled: true,
            window: Duration::from_secs(60),
            max_requests: 100,
            public_prefixes: vec!["/health".to_string()],
        }
    }
}

impl AuthConfig {
    /// Validate the configuration. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.as_deref().unwrap_or("").is_empty() && !self.allow_unconfigured {
            return Err(ConfigError::MissingApiKey);
        }
        if self.rate_limit_enabled {
            if self.window.is_zero() {
                return Err(ConfigError::ZeroWindow);
            }
            if self.max_requests == 0 {
                return Err(ConfigError::ZeroQuota);
            }
        }
        Ok(())
    }
}

/// Tenant-namespace extraction settings.
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    /// Dedicated header carrying the namespace.
    pub header_name: String,

    /// Prefixes for which the namespace middleware is skipped
    /// entirely.
    pub skip_prefixes: Vec<String>,

    /// Prefixes allowed to proceed without any namespace source.
    pub optional_prefixes: Vec<String>,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            header_name: "x-namespace".to_string(),
            skip_prefixes: vec![
                "/health".to_string(),
                "/dashboard".to_string(),
                "/v1/routes".to_string(),
            ],
            optional_prefixes: Vec::new(),
        }
    }
}
