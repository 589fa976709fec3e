//! memgate data plane server.
//!
//! Binds the data plane: security middlewares, namespace policies,
//! static dashboard, service routes, and the WebSocket surface.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info};

use memgate_lib::config::{AuthConfig, NamespaceConfig, ServerConfig, DEFAULT_MAX_BODY_SIZE};
use memgate_lib::middleware::{
    ApiKeyAuth, EnsureNamespace, NamespaceExtractor, RequireNamespace, StaticDir,
};
use memgate_lib::ratelimit::spawn_sweep_task;
use memgate_lib::tenants::InMemoryTenantRegistry;
use memgate_lib::{Reply, Server};
use memgate_telemetry::{events, init_logging, LogFormat, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "memgate", about = "memgate data plane server", version)]
struct Cli {
    /// Listen address.
    #[arg(long, env = "MEMGATE_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// API key required on non-public routes.
    #[arg(long, env = "MEMGATE_API_KEY")]
    api_key: Option<String>,

    /// Header the API key is read from.
    #[arg(long, env = "MEMGATE_API_KEY_HEADER", default_value = "x-api-key")]
    api_key_header: String,

    /// Run without an API key, allowing all requests (fail-open).
    #[arg(long, env = "MEMGATE_ALLOW_UNCONFIGURED")]
    allow_unconfigured: bool,

    /// Disable fixed-window rate limiting.
    #[arg(long, env = "MEMGATE_NO_RATE_LIMIT")]
    no_rate_limit: bool,

    /// Rate-limit window in milliseconds.
    #[arg(long, env = "MEMGATE_RATE_WINDOW_MS", default_value = "60000")]
    rate_window_ms: u64,

    /// Maximum requests per fingerprint per window.
    #[arg(long, env = "MEMGATE_RATE_MAX_REQUESTS", default_value = "100")]
    rate_max_requests: u32,

    /// Path prefixes that bypass authentication. Repeatable.
    #[arg(long = "public-prefix", default_values = ["/health", "/dashboard"])]
    public_prefixes: Vec<String>,

    /// Header carrying the tenant namespace.
    #[arg(long, env = "MEMGATE_NAMESPACE_HEADER", default_value = "x-namespace")]
    namespace_header: String,

    /// Path prefixes skipped by the namespace middleware. Repeatable.
    #[arg(
        long = "namespace-skip-prefix",
        default_values = ["/health", "/dashboard", "/v1/routes"]
    )]
    namespace_skip_prefixes: Vec<String>,

    /// Path prefixes allowed to proceed without a namespace. Repeatable.
    #[arg(long = "namespace-optional-prefix")]
    namespace_optional_prefixes: Vec<String>,

    /// Reject requests against namespaces with no tenant record,
    /// instead of auto-provisioning them.
    #[arg(long, env = "MEMGATE_STRICT_TENANTS")]
    strict_tenants: bool,

    /// Maximum JSON request body size in bytes.
    #[arg(long, env = "MEMGATE_MAX_BODY_SIZE", default_value_t = DEFAULT_MAX_BODY_SIZE)]
    max_body_size: usize,

    /// Serve the dashboard from this directory under /dashboard.
    #[arg(long, env = "MEMGATE_DASHBOARD_ROOT")]
    dashboard_root: Option<String>,

    /// Log level.
    #[arg(long, env = "MEMGATE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format (json or pretty).
    #[arg(long, env = "MEMGATE_LOG_FORMAT", default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_format = match LogFormat::parse(&cli.log_format) {
        Some(f) => f,
        None => {
            eprintln!("error: invalid log format: {}", cli.log_format);
            return ExitCode::from(1);
        }
    };
    let telemetry = TelemetryConfig::new()
        .with_log_level(&cli.log_level)
        .with_log_format(log_format);
    if let Err(e) = init_logging(&telemetry) {
        eprintln!("error: {}", e);
        return ExitCode::from(1);
    }

    let addr: SocketAddr = match cli.listen.parse() {
        Ok(a) => a,
        Err(_) => {
            error!("invalid listen address: {}", cli.listen);
            return ExitCode::from(1);
        }
    };

    let auth_config = AuthConfig {
        api_key: cli.api_key.clone(),
        header_name: cli.api_key_header.clone(),
        allow_unconfigured: cli.allow_unconfigured,
        rate_limit_enabled: !cli.no_rate_limit,
        window: Duration::from_millis(cli.rate_window_ms),
        max_requests: cli.rate_max_requests,
        public_prefixes: cli.public_prefixes.clone(),
    };

    let auth = match ApiKeyAuth::new(auth_config) {
        Ok(auth) => auth,
        Err(e) => {
            error!("configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    // Sweep expired rate-limit windows once per window.
    if let Some(limiter) = auth.limiter() {
        spawn_sweep_task(limiter, Duration::from_millis(cli.rate_window_ms));
    }

    let namespace_config = NamespaceConfig {
        header_name: cli.namespace_header.clone(),
        skip_prefixes: cli.namespace_skip_prefixes.clone(),
        optional_prefixes: cli.namespace_optional_prefixes.clone(),
    };

    let registry = Arc::new(InMemoryTenantRegistry::new());

    let mut server = Server::new(ServerConfig {
        max_body_size: cli.max_body_size,
    });

    if let Some(root) = &cli.dashboard_root {
        server.wrap(StaticDir::mount("/dashboard", root.clone()));
    }
    server.wrap(auth);
    server.wrap(NamespaceExtractor::new(namespace_config));
    if cli.strict_tenants {
        server.wrap(RequireNamespace::new(registry));
    } else {
        server.wrap(EnsureNamespace::new(registry));
    }

    server.get("/health", |_ctx| async {
        Ok(Reply::new().json(&serde_json::json!({ "status": "ok" })))
    });

    server.ws("/ws/echo", |mut ws, _req| async move {
        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Text(_) | Message::Binary(_) => {
                    if ws.send(message).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Snapshot the table for the introspection route, counting the
    // route itself.
    let route_map = {
        let mut map = server.routes();
        map.entry("GET".to_string())
            .or_default()
            .push("/v1/routes".to_string());
        map
    };
    let ws_paths = server.ws_paths();
    server.get("/v1/routes", move |_ctx| {
        let route_map = route_map.clone();
        let ws_paths = ws_paths.clone();
        async move {
            Ok(Reply::new().json(&serde_json::json!({
                "routes": route_map,
                "ws": ws_paths,
            })))
        }
    });

    info!(
        event = events::STARTUP,
        listen = %addr,
        strict_tenants = cli.strict_tenants,
        rate_limit = !cli.no_rate_limit,
    );

    let bound = match server.bind(addr).await {
        Ok(bound) => bound,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            return ExitCode::from(1);
        }
    };

    tokio::select! {
        result = bound.serve() => {
            if let Err(e) = result {
                error!("server error: {}", e);
                return ExitCode::from(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(event = events::SHUTDOWN);
        }
    }

    ExitCode::SUCCESS
}
