//! Connection dispatcher: the top-level request/upgrade entry point.
//!
//! Wires together URL parsing, the middleware pipeline, the route
//! table, and the WebSocket route table on top of a raw hyper http1
//! connection loop. Ordinary requests flow: parse → route match
//! (binding params) → body ingest → pipeline → handler or 404.
//! Upgrade requests are validated, looked up by exact path, and either
//! handed to a WebSocket handler or the socket is destroyed without a
//! handshake.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use memgate_telemetry::events;

use crate::body::{ingest_json, BodyError};
use crate::config::{ServerConfig, HEADER_READ_TIMEOUT};
use crate::error::{ApiError, ServeError};
use crate::pipeline::{self, into_handler, into_ws_handler, Action, Middleware, WsStream};
use crate::request::{
    apply_headers, normalize_hostname, parse_query, HttpResponse, Reply, RequestContext, WsRequest,
};
use crate::router::{MethodFilter, RouteMatch, RouteTable, WsRouteTable};

/// The server under construction: registration surface for routes,
/// WebSocket routes, and the middleware pipeline. All registration
/// happens before `bind`; the tables are immutable afterwards.
#[derive(Default)]
pub struct Server {
    config: ServerConfig,
    routes: RouteTable,
    ws_routes: WsRouteTable,
    pipeline: Vec<Arc<dyn Middleware>>,
}

macro_rules! method_registrar {
    ($(#[$doc:meta])* $name:ident, $method:expr) => {
        $(#[$doc])*
        pub fn $name<F, Fut>(&mut self, pattern: &str, handler: F)
        where
            F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<HttpResponse, ApiError>> + Send + 'static,
        {
            self.route(MethodFilter::Only($method), pattern, handler);
        }
    };
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Register a route for an explicit method filter.
    pub fn route<F, Fut>(&mut self, method: MethodFilter, pattern: &str, handler: F)
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, ApiError>> + Send + 'static,
    {
        self.routes.insert(method, pattern, into_handler(handler));
    }

    method_registrar!(get, Method::GET);
    method_registrar!(post, Method::POST);
    method_registrar!(put, Method::PUT);
    method_registrar!(delete, Method::DELETE);
    method_registrar!(patch, Method::PATCH);
    method_registrar!(options, Method::OPTIONS);
    method_registrar!(head, Method::HEAD);

    /// Register a route matching every method.
    pub fn all<F, Fut>(&mut self, pattern: &str, handler: F)
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, ApiError>> + Send + 'static,
    {
        self.route(MethodFilter::All, pattern, handler);
    }

    /// Append a middleware to the pipeline. Execution follows
    /// registration order.
    pub fn wrap(&mut self, middleware: impl Middleware + 'static) {
        self.pipeline.push(Arc::new(middleware));
    }

    /// Register a WebSocket route. Exact path match only.
    pub fn ws<F, Fut>(&mut self, path: &str, handler: F)
    where
        F: Fn(WsStream, WsRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ws_routes.insert(path, into_ws_handler(handler));
    }

    /// Method → registered patterns, for introspection tooling.
    pub fn routes(&self) -> BTreeMap<String, Vec<String>> {
        self.routes.patterns()
    }

    /// Registered WebSocket paths.
    pub fn ws_paths(&self) -> Vec<String> {
        self.ws_routes.paths()
    }

    /// Bind the listening socket.
    pub async fn bind(self, addr: SocketAddr) -> std::io::Result<Bound> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            event = events::LISTENING,
            addr = %local_addr,
            routes = self.routes.len(),
        );

        Ok(Bound {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                config: self.config,
                routes: self.routes,
                ws_routes: self.ws_routes,
                pipeline: self.pipeline,
            }),
        })
    }
}

/// A server bound to a socket, ready to serve.
pub struct Bound {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl Bound {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the task is dropped.
    pub async fn serve(self) -> std::io::Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            };

            let shared = Arc::clone(&self.shared);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);

                let service = service_fn(move |req| {
                    let shared = Arc::clone(&shared);
                    async move { shared.dispatch(req, peer).await }
                });

                if let Err(e) = http1::Builder::new()
                    .timer(TokioTimer::new())
                    .header_read_timeout(HEADER_READ_TIMEOUT)
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    // Destroyed upgrade sockets and client aborts land here.
                    debug!(peer = %peer, error = %e, "connection closed");
                }
            });
        }
    }
}

/// State shared by all connections after startup: read-only tables
/// plus the pipeline.
struct Shared {
    config: ServerConfig,
    routes: RouteTable,
    ws_routes: WsRouteTable,
    pipeline: Vec<Arc<dyn Middleware>>,
}

impl Shared {
    /// Entry point for every request on a connection.
    async fn dispatch(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<HttpResponse, ServeError> {
        if hyper_tungstenite::is_upgrade_request(&req) {
            self.handle_upgrade(req, peer)
        } else {
            Ok(self.handle_http(req, peer).await)
        }
    }

    /// Ordinary request path.
    async fn handle_http(&self, req: Request<Incoming>, peer: SocketAddr) -> HttpResponse {
        let start = Instant::now();

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = parse_query(req.uri().query());

        let mut ctx = RequestContext::new(method.clone(), path.clone(), peer.ip());
        ctx.query = query;
        for (name, value) in req.headers() {
            if let Ok(value) = value.to_str() {
                ctx.headers
                    .insert(name.as_str().to_lowercase(), value.to_string());
            }
        }
        ctx.hostname = normalize_hostname(ctx.header("host").unwrap_or(""));

        let request_id = ctx.id;

        // Match before the pipeline runs so middleware can read route
        // parameters; the handler itself is only invoked afterwards.
        let matched = self.routes.lookup(&method, &path);
        if let Some(route_match) = &matched {
            ctx.params = route_match.params.clone();
        }

        let (staged, mut response) = self.process(req, ctx, matched).await;
        apply_headers(&mut response, &staged);

        info!(
            event = events::REQUEST_COMPLETED,
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            request_id = %request_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
        );

        response
    }

    /// Ingest the body, run the pipeline, dispatch to the handler.
    /// Returns the headers staged on the context alongside the
    /// response so they can be merged in by the caller.
    async fn process(
        &self,
        req: Request<Incoming>,
        mut ctx: RequestContext,
        matched: Option<RouteMatch>,
    ) -> (BTreeMap<String, String>, HttpResponse) {
        let content_type = ctx.header("content-type").map(str::to_string);
        let content_length = ctx.header("content-length").and_then(|v| v.parse().ok());

        match ingest_json(
            content_type.as_deref(),
            content_length,
            req.into_body(),
            self.config.max_body_size,
        )
        .await
        {
            Ok(parsed) => ctx.body = parsed,
            Err(BodyError::TooLarge { limit }) => {
                warn!(
                    event = events::BODY_LIMIT_EXCEEDED,
                    path = %ctx.path,
                    limit,
                );
                // Stop reading and tell hyper to tear the connection
                // down once the response is written.
                let response = Reply::status(StatusCode::PAYLOAD_TOO_LARGE)
                    .header("connection", "close")
                    .json(&serde_json::json!({
                        "error": format!("request body exceeds {} bytes", limit),
                    }));
                return (ctx.response_headers().clone(), response);
            }
            Err(e @ BodyError::Read(_)) => {
                let response = ApiError::BadRequest(e.to_string()).into_response();
                return (ctx.response_headers().clone(), response);
            }
        }

        match pipeline::run(&self.pipeline, &mut ctx).await {
            Ok(Action::ShortCircuit(response)) => (ctx.response_headers().clone(), response),
            Err(e) => (ctx.response_headers().clone(), e.into_response()),
            Ok(Action::Continue) => match matched {
                Some(route_match) => {
                    let staged = ctx.response_headers().clone();
                    match (route_match.handler)(ctx).await {
                        Ok(response) => (staged, response),
                        Err(e) => (staged, e.into_response()),
                    }
                }
                None => (ctx.response_headers().clone(), not_found_response()),
            },
        }
    }

    /// Protocol-upgrade path. A rejected or unmatched target returns
    /// `Err`, which aborts the connection without an HTTP response;
    /// this is the socket-destroy path for bad upgrades.
    fn handle_upgrade(
        &self,
        mut req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<HttpResponse, ServeError> {
        let path = req.uri().path().to_string();

        // Hard security boundary, not a soft validation.
        if path.contains("..") || path.chars().any(|c| c.is_control()) {
            warn!(
                event = events::WS_REJECTED,
                peer = %peer,
                path = %path,
                reason = "invalid path",
            );
            return Err(ServeError::UpgradeRejected);
        }

        let Some(handler) = self.ws_routes.lookup(&path) else {
            debug!(
                event = events::WS_REJECTED,
                peer = %peer,
                path = %path,
                reason = "no route",
            );
            return Err(ServeError::UpgradeUnmatched);
        };

        let mut headers = BTreeMap::new();
        for (name, value) in req.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_lowercase(), value.to_string());
            }
        }
        let ws_req = WsRequest {
            path: path.clone(),
            query: parse_query(req.uri().query()),
            headers,
            client_ip: peer.ip(),
        };

        match hyper_tungstenite::upgrade(&mut req, None) {
            Ok((response, websocket)) => {
                tokio::spawn(async move {
                    match websocket.await {
                        Ok(ws) => {
                            info!(event = events::WS_UPGRADE, path = %ws_req.path);
                            handler(ws, ws_req).await;
                        }
                        Err(e) => warn!(error = %e, "websocket handshake failed"),
                    }
                });

                let (parts, _) = response.into_parts();
                Ok(Response::from_parts(parts, Full::new(Bytes::new())))
            }
            Err(e) => Ok(Reply::status(StatusCode::BAD_REQUEST)
                .text(format!("websocket upgrade failed: {}", e))),
        }
    }
}

/// The fixed 404 fallback: the only plain-text error in the core.
fn not_found_response() -> HttpResponse {
    Reply::status(StatusCode::NOT_FOUND).text("404: Not Found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_surface_is_introspectable() {
        let mut server = Server::new(ServerConfig::default());
        server.get("/health", |_ctx| async { Ok(Reply::new().text("ok")) });
        server.post("/memories", |_ctx| async { Ok(Reply::new().text("ok")) });
        server.all("/anything", |_ctx| async { Ok(Reply::new().text("ok")) });
        server.ws("/ws/stream", |_ws, _req| async {});

        let routes = server.routes();
        assert_eq!(routes.get("GET"), Some(&vec!["/health".to_string()]));
        assert_eq!(routes.get("POST"), Some(&vec!["/memories".to_string()]));
        assert_eq!(routes.get("ALL"), Some(&vec!["/anything".to_string()]));
        assert_eq!(server.ws_paths(), vec!["/ws/stream".to_string()]);
    }

    #[test]
    fn not_found_body_is_fixed() {
        let resp = not_found_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
