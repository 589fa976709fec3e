//! Tenant-namespace extraction, validation, and back-fill.
//!
//! The namespace is resolved from the request in strict priority
//! order, validated against `^[A-Za-z0-9_-]+$`, stored on the request
//! context, and written back into the body so downstream handlers see
//! one consistent identifier regardless of which source supplied it.
//!
//! Two companion policy middlewares consult the tenant registry:
//! [`EnsureNamespace`] auto-provisions missing records,
//! [`RequireNamespace`] rejects requests against unknown tenants.
//! They are alternates selected by the owning application, never both.

use std::sync::{Arc, OnceLock};

use futures_util::future::BoxFuture;
use regex_lite::Regex;
use tracing::info;

use crate::config::NamespaceConfig;
use crate::error::ApiError;
use crate::pipeline::{Action, Middleware};
use crate::request::RequestContext;
use crate::tenants::TenantRegistry;

/// The only shape a validated namespace may take.
fn namespace_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[A-Za-z0-9_-]+$").expect("pattern is valid"))
}

/// Whether a candidate value is a valid namespace.
pub fn is_valid_namespace(value: &str) -> bool {
    namespace_pattern().is_match(value)
}

/// Resolve the namespace from a request, in strict priority order:
/// dedicated header, body field (`namespace` or `user_id`), query
/// parameter, route parameter, nested body filter field.
pub fn resolve_namespace(ctx: &RequestContext, header_name: &str) -> Option<String> {
    if let Some(value) = ctx.header(header_name) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    if let Some(body) = ctx.body.as_ref().and_then(|b| b.as_object()) {
        for field in ["namespace", "user_id"] {
            if let Some(value) = body.get(field).and_then(|v| v.as_str()) {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }

    for field in ["namespace", "user_id"] {
        if let Some(value) = ctx.query.get(field) {
            if !value.is_empty() {
                return Some(value.clone());
            }
        }
    }

    for field in ["namespace", "user_id"] {
        if let Some(value) = ctx.params.get(field) {
            if !value.is_empty() {
                return Some(value.clone());
            }
        }
    }

    ctx.body
        .as_ref()
        .and_then(|b| b.get("filter"))
        .and_then(|f| f.get("user_id"))
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Namespace extractor/validator middleware.
pub struct NamespaceExtractor {
    config: NamespaceConfig,
}

impl NamespaceExtractor {
    pub fn new(config: NamespaceConfig) -> Self {
        Self { config }
    }

    fn skipped(&self, path: &str) -> bool {
        self.config
            .skip_prefixes
            .iter()
            .any(|prefix| path == prefix || path.starts_with(prefix.as_str()))
    }

    fn optional(&self, path: &str) -> bool {
        self.config
            .optional_prefixes
            .iter()
            .any(|prefix| path == prefix || path.starts_with(prefix.as_str()))
    }

    /// Back-fill the resolved namespace into the body's `user_id` and
    /// nested filter field, if a body object is present.
    fn backfill(ctx: &mut RequestContext, namespace: &str) {
        let Some(body) = ctx.body.as_mut().and_then(|b| b.as_object_mut()) else {
            return;
        };

        body.insert(
            "user_id".to_string(),
            serde_json::Value::String(namespace.to_string()),
        );

        if let Some(filter) = body.get_mut("filter").and_then(|f| f.as_object_mut()) {
            filter.insert(
                "user_id".to_string(),
                serde_json::Value::String(namespace.to_string()),
            );
        }
    }
}

impl Middleware for NamespaceExtractor {
    fn name(&self) -> &'static str {
        "namespace"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<Action, ApiError>> {
        Box::pin(async move {
            if self.skipped(&ctx.path) {
                return Ok(Action::Continue);
            }

            let Some(namespace) = resolve_namespace(ctx, &self.config.header_name) else {
                if self.optional(&ctx.path) {
                    return Ok(Action::Continue);
                }
                return Err(ApiError::BadRequest(
                    "namespace required: supply a namespace header, body field, or query parameter"
                        .to_string(),
                ));
            };

            if !is_valid_namespace(&namespace) {
                return Err(ApiError::BadRequest(format!(
                    "invalid namespace: {:?}",
                    namespace
                )));
            }

            Self::backfill(ctx, &namespace);
            ctx.namespace = Some(namespace);
            Ok(Action::Continue)
        })
    }
}

/// Auto-provisioning policy: create a tenant record the first time a
/// namespace is seen. No-op when the extractor left no namespace.
pub struct EnsureNamespace {
    registry: Arc<dyn TenantRegistry>,
}

impl EnsureNamespace {
    pub fn new(registry: Arc<dyn TenantRegistry>) -> Self {
        Self { registry }
    }
}

impl Middleware for EnsureNamespace {
    fn name(&self) -> &'static str {
        "ensure-namespace"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<Action, ApiError>> {
        Box::pin(async move {
            if let Some(namespace) = ctx.namespace.clone() {
                if self.registry.provision(&namespace).await {
                    info!(
                        event = memgate_telemetry::events::NAMESPACE_PROVISIONED,
                        namespace = %namespace,
                    );
                }
            }
            Ok(Action::Continue)
        })
    }
}

/// Strict policy: reject requests whose namespace has no record.
pub struct RequireNamespace {
    registry: Arc<dyn TenantRegistry>,
}

impl RequireNamespace {
    pub fn new(registry: Arc<dyn TenantRegistry>) -> Self {
        Self { registry }
    }
}

impl Middleware for RequireNamespace {
    fn name(&self) -> &'static str {
        "require-namespace"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<Action, ApiError>> {
        Box::pin(async move {
            if let Some(namespace) = ctx.namespace.as_deref() {
                if !self.registry.exists(namespace).await {
                    return Err(ApiError::NotFound(format!(
                        "unknown namespace: {}",
                        namespace
                    )));
                }
            }
            Ok(Action::Continue)
        })
    }
}
