//! API-key authentication fused with fixed-window rate limiting.
//!
//! Per-request state machine: public prefix ⇒ allow; no key configured
//! ⇒ allow only when fail-open was opted into; extract the key from
//! the configured header or an `Authorization` prefix, 401 when
//! absent; compare SHA-256 digests, 403 on mismatch; then check the
//! fixed window for the client fingerprint, attach `X-RateLimit-*`
//! headers, and 429 with a retry hint when exceeded.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::{AuthConfig, ConfigError};
use crate::error::ApiError;
use crate::pipeline::{Action, Middleware};
use crate::ratelimit::{client_fingerprint, RateLimiter};
use crate::request::{Reply, RequestContext};

/// API key validation failure.
#[derive(Debug)]
enum AuthFailure {
    MissingKey,
    InvalidKey,
}

impl AuthFailure {
    fn description(&self) -> &'static str {
        match self {
            AuthFailure::MissingKey => "API key required",
            AuthFailure::InvalidKey => "Invalid API key",
        }
    }
}

/// Authentication + rate limiting middleware.
pub struct ApiKeyAuth {
    config: AuthConfig,
    /// SHA-256 of the configured key; `None` when running fail-open.
    key_digest: Option<[u8; 32]>,
    limiter: Option<Arc<RateLimiter>>,
}

impl ApiKeyAuth {
    /// Build from configuration. Fails fast on an unusable config.
    pub fn new(config: AuthConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let key_digest = config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(|k| Sha256::digest(k.as_bytes()).into());

        if key_digest.is_none() {
            warn!("no API key configured; authentication is disabled and all requests are allowed");
        }

        let limiter = config
            .rate_limit_enabled
            .then(|| Arc::new(RateLimiter::new(config.window, config.max_requests)));

        Ok(Self {
            config,
            key_digest,
            limiter,
        })
    }

    /// The limiter, for wiring the background sweep.
    pub fn limiter(&self) -> Option<Arc<RateLimiter>> {
        self.limiter.clone()
    }

    fn is_public(&self, path: &str) -> bool {
        self.config
            .public_prefixes
            .iter()
            .any(|prefix| path == prefix || path.starts_with(prefix.as_str()))
    }

    /// Read the key from the configured header, else from an
    /// `Authorization` header with a `Bearer ` or `ApiKey ` prefix.
    fn extract_key(&self, ctx: &RequestContext) -> Option<String> {
        if let Some(key) = ctx.header(&self.config.header_name) {
            let key = key.trim();
            if !key.is_empty() {
                return Some(key.to_string());
            }
        }

        let auth = ctx.header("authorization")?;
        let key = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("ApiKey "))?
            .trim();
        (!key.is_empty()).then(|| key.to_string())
    }

    /// Digest comparison: both sides are hashed to a fixed length, so
    /// the comparison leaks neither content nor key length.
    fn validate_key(&self, presented: &str, expected_digest: &[u8; 32]) -> bool {
        let presented: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        let mut diff = 0u8;
        for (a, b) in presented.iter().zip(expected_digest) {
            diff |= a ^ b;
        }
        diff == 0
    }

    /// Apply the fixed window and stage the response headers.
    fn check_rate_limit(&self, ctx: &mut RequestContext, key: Option<&str>) -> Result<(), ApiError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        let fingerprint = match key {
            Some(key) => client_fingerprint(key),
            None => client_fingerprint(&ctx.client_ip.to_string()),
        };

        let decision = limiter.check(&fingerprint);

        ctx.set_response_header("x-ratelimit-limit", decision.limit.to_string());
        ctx.set_response_header("x-ratelimit-remaining", decision.remaining.to_string());
        ctx.set_response_header("x-ratelimit-reset", decision.reset.to_string());

        if decision.allowed {
            Ok(())
        } else {
            let retry_after = decision.retry_after.unwrap_or(1);
            ctx.set_response_header("retry-after", retry_after.to_string());
            debug!(
                event = memgate_telemetry::events::RATE_LIMIT_EXCEEDED,
                fingerprint = %fingerprint,
                path = %ctx.path,
                retry_after,
            );
            Err(ApiError::RateLimited { retry_after })
        }
    }
}

impl Middleware for ApiKeyAuth {
    fn name(&self) -> &'static str {
        "api-key-auth"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<Action, ApiError>> {
        Box::pin(async move {
            if self.is_public(&ctx.path) {
                return Ok(Action::Continue);
            }

            let Some(expected_digest) = &self.key_digest else {
                // Fail-open was opted into at startup.
                self.check_rate_limit(ctx, None)?;
                return Ok(Action::Continue);
            };

            let Some(presented) = self.extract_key(ctx) else {
                return Ok(Action::ShortCircuit(
                    Reply::status(hyper::StatusCode::UNAUTHORIZED)
                        .json(&serde_json::json!({ "error": AuthFailure::MissingKey.description() })),
                ));
            };

            if !self.validate_key(&presented, expected_digest) {
                return Ok(Action::ShortCircuit(
                    Reply::status(hyper::StatusCode::FORBIDDEN)
                        .json(&serde_json::json!({ "error": AuthFailure::InvalidKey.description() })),
                ));
            }

            self.check_rate_limit(ctx, Some(&presented))?;
            Ok(Action::Continue)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{Method, StatusCode};
    use std::time::Duration;

    fn auth(config: AuthConfig) -> ApiKeyAuth {
        ApiKeyAuth::new(config).expect("valid config")
    }

    fn config(key: Option<&str>) -> AuthConfig {
        AuthConfig {
            api_key: key.map(String::from),
            allow_unconfigured: key.is_none(),
            rate_limit_enabled: false,
            ..AuthConfig::default()
        }
    }

    fn request(path: &str, headers: &[(&str, &str)]) -> RequestContext {
        let mut ctx = RequestContext::new(Method::GET, path.into(), "127.0.0.1".parse().unwrap());
        for (name, value) in headers {
            ctx.headers.insert(name.to_lowercase(), value.to_string());
        }
        ctx
    }

    async fn status_of(auth: &ApiKeyAuth, ctx: &mut RequestContext) -> Option<StatusCode> {
        match auth.handle(ctx).await {
            Ok(Action::Continue) => None,
            Ok(Action::ShortCircuit(resp)) => Some(resp.status()),
            Err(e) => Some(e.status()),
        }
    }

    #[tokio::test]
    async fn correct_key_is_allowed() {
        let auth = auth(config(Some("secret")));
        let mut ctx = request("/memories", &[("x-api-key", "secret")]);
        assert_eq!(status_of(&auth, &mut ctx).await, None);
    }

    #[tokio::test]
    async fn wrong_key_is_forbidden() {
        let auth = auth(config(Some("secret")));
        let mut ctx = request("/memories", &[("x-api-key", "wrong")]);
        assert_eq!(status_of(&auth, &mut ctx).await, Some(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn missing_key_is_unauthorized() {
        let auth = auth(config(Some("secret")));
        let mut ctx = request("/memories", &[]);
        assert_eq!(
            status_of(&auth, &mut ctx).await,
            Some(StatusCode::UNAUTHORIZED)
        );
    }

    #[tokio::test]
    async fn public_prefix_bypasses_auth() {
        let auth = auth(config(Some("secret")));
        let mut ctx = request("/health", &[]);
        assert_eq!(status_of(&auth, &mut ctx).await, None);

        let mut ctx = request("/health/live", &[]);
        assert_eq!(status_of(&auth, &mut ctx).await, None);
    }

    #[tokio::test]
    async fn bearer_prefix_is_accepted() {
        let auth = auth(config(Some("secret")));
        let mut ctx = request("/memories", &[("authorization", "Bearer secret")]);
        assert_eq!(status_of(&auth, &mut ctx).await, None);
    }

    #[tokio::test]
    async fn apikey_prefix_is_accepted() {
        let auth = auth(config(Some("secret")));
        let mut ctx = request("/memories", &[("authorization", "ApiKey secret")]);
        assert_eq!(status_of(&auth, &mut ctx).await, None);
    }

    #[tokio::test]
    async fn unconfigured_key_fails_open_when_opted_in() {
        let auth = auth(config(None));
        let mut ctx = request("/memories", &[]);
        assert_eq!(status_of(&auth, &mut ctx).await, None);
    }

    #[tokio::test]
    async fn rate_limit_blocks_fourth_request() {
        let auth = auth(AuthConfig {
            api_key: Some("secret".to_string()),
            rate_limit_enabled: true,
            window: Duration::from_secs(60),
            max_requests: 3,
            ..AuthConfig::default()
        });

        for _ in 0..3 {
            let mut ctx = request("/memories", &[("x-api-key", "secret")]);
            assert_eq!(status_of(&auth, &mut ctx).await, None);
        }

        let mut ctx = request("/memories", &[("x-api-key", "secret")]);
        assert_eq!(
            status_of(&auth, &mut ctx).await,
            Some(StatusCode::TOO_MANY_REQUESTS)
        );
        assert!(ctx.response_headers().contains_key("retry-after"));
        assert_eq!(
            ctx.response_headers().get("x-ratelimit-remaining"),
            Some(&"0".to_string())
        );
    }

    #[tokio::test]
    async fn rate_limit_headers_attached_on_success() {
        let auth = auth(AuthConfig {
            api_key: Some("secret".to_string()),
            rate_limit_enabled: true,
            window: Duration::from_secs(60),
            max_requests: 5,
            ..AuthConfig::default()
        });

        let mut ctx = request("/memories", &[("x-api-key", "secret")]);
        assert_eq!(status_of(&auth, &mut ctx).await, None);
        assert_eq!(
            ctx.response_headers().get("x-ratelimit-limit"),
            Some(&"5".to_string())
        );
        assert_eq!(
            ctx.response_headers().get("x-ratelimit-remaining"),
            Some(&"4".to_string())
        );
    }
}
