//! In-process test harness.
//!
//! Binds a [`Server`] on a random loopback port, serves it on a
//! background task, and provides HTTP and WebSocket request helpers.

use std::net::SocketAddr;

use thiserror::Error;

use memgate_lib::server::Server;

/// Errors from TestServer operations.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Full-stack test harness.
///
/// Boots the server in-process on a random port and provides request
/// helpers. The serve task is aborted when the harness drops.
pub struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
    serve_task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Bind and serve the given server on a random loopback port.
    pub async fn spawn(server: Server) -> Result<Self, TestError> {
        let bound = server.bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = bound.local_addr();

        let serve_task = tokio::spawn(async move {
            let _ = bound.serve().await;
        });

        Ok(Self {
            addr,
            client: reqwest::Client::new(),
            serve_task,
        })
    }

    /// The bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base HTTP URL of the server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// WebSocket URL for the given path.
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Make a GET request to the given path.
    pub async fn get(&self, path: &str) -> Result<reqwest::Response, TestError> {
        Ok(self.request(reqwest::Method::GET, path).send().await?)
    }

    /// Make a POST request with a JSON body.
    pub async fn post_json(
        &self,
        path: &str,
        body: &str,
    ) -> Result<reqwest::Response, TestError> {
        Ok(self
            .request(reqwest::Method::POST, path)
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await?)
    }

    /// Build a request with any method; callers add headers/bodies.
    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url(), path))
    }

    /// Send a raw HTTP/1.1 request and collect the response bytes.
    ///
    /// HTTP clients normalize `..` path segments before sending, so
    /// traversal tests must write the request line verbatim.
    pub async fn raw_get(&self, path: &str) -> Result<String, TestError> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(self.addr).await?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, self.addr
        );
        stream.write_all(request.as_bytes()).await?;

        let mut response = String::new();
        stream.read_to_string(&mut response).await?;
        Ok(response)
    }

    /// Open a WebSocket connection to the given path.
    pub async fn ws_connect(
        &self,
        path: &str,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        TestError,
    > {
        let (ws, _response) = tokio_tungstenite::connect_async(self.ws_url(path)).await?;
        Ok(ws)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.serve_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    use memgate_lib::config::{AuthConfig, NamespaceConfig, ServerConfig};
    use memgate_lib::middleware::{
        ApiKeyAuth, EnsureNamespace, NamespaceExtractor, RequireNamespace, StaticDir,
    };
    use memgate_lib::tenants::InMemoryTenantRegistry;
    use memgate_lib::{Reply, Server};

    fn base_server() -> Server {
        Server::new(ServerConfig::default())
    }

    /// A server with echo routes and no middleware.
    fn routes_only() -> Server {
        let mut server = base_server();
        server.get("/health", |_ctx| async {
            Ok(Reply::new().json(&serde_json::json!({ "status": "ok" })))
        });
        server.get("/agents/:id", |ctx| async move {
            Ok(Reply::new().json(&serde_json::json!({ "id": ctx.params.get("id") })))
        });
        server.post("/memories", |ctx| async move {
            Ok(Reply::new().json(&serde_json::json!({
                "body": ctx.body,
                "namespace": ctx.namespace,
            })))
        });
        server
    }

    fn auth_config(key: &str, max_requests: u32, window: Duration) -> AuthConfig {
        AuthConfig {
            api_key: Some(key.to_string()),
            rate_limit_enabled: max_requests > 0,
            window,
            max_requests,
            public_prefixes: vec!["/health".to_string()],
            ..AuthConfig::default()
        }
    }

    // === Routing ===

    #[tokio::test]
    async fn registered_route_responds() {
        let server = TestServer::spawn(routes_only()).await.unwrap();

        let resp = server.get("/health").await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn unmatched_route_is_plain_text_404() {
        let server = TestServer::spawn(routes_only()).await.unwrap();

        let resp = server.get("/nonexistent").await.unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.text().await.unwrap(), "404: Not Found");
    }

    #[tokio::test]
    async fn wrong_method_is_404() {
        let server = TestServer::spawn(routes_only()).await.unwrap();

        let resp = server
            .request(reqwest::Method::DELETE, "/health")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn path_params_are_bound_and_decoded() {
        let server = TestServer::spawn(routes_only()).await.unwrap();

        let resp = server.get("/agents/42").await.unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["id"], "42");

        let resp = server.get("/agents/team%20one").await.unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["id"], "team one");
    }

    // === Body ingestion ===

    #[tokio::test]
    async fn json_body_round_trips() {
        let server = TestServer::spawn(routes_only()).await.unwrap();

        let resp = server.post_json("/memories", r#"{"a":1}"#).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["body"]["a"], 1);
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let mut server = Server::new(ServerConfig { max_body_size: 64 });
        server.post("/memories", |_ctx| async {
            Ok(Reply::new().text("handler ran"))
        });
        let server = TestServer::spawn(server).await.unwrap();

        let big = format!(r#"{{"data":"{}"}}"#, "x".repeat(256));
        let resp = server.post_json("/memories", &big).await.unwrap();
        assert_eq!(resp.status(), 413);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("64"));
    }

    #[tokio::test]
    async fn malformed_json_yields_null_body() {
        let server = TestServer::spawn(routes_only()).await.unwrap();

        let resp = server.post_json("/memories", r#"{"a":"#).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["body"].is_null());
    }

    #[tokio::test]
    async fn non_json_content_passes_with_no_body() {
        let server = TestServer::spawn(routes_only()).await.unwrap();

        let resp = server
            .request(reqwest::Method::POST, "/memories")
            .header("content-type", "text/plain")
            .body(r#"{"a":1}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["body"].is_null());
    }

    // === Authentication & rate limiting ===

    async fn auth_server(max_requests: u32, window: Duration) -> TestServer {
        let mut server = routes_only();
        server.wrap(
            ApiKeyAuth::new(auth_config("secret", max_requests, window)).unwrap(),
        );
        TestServer::spawn(server).await.unwrap()
    }

    #[tokio::test]
    async fn correct_key_allowed_wrong_forbidden_missing_unauthorized() {
        let server = auth_server(0, Duration::from_secs(60)).await;

        let resp = server
            .request(reqwest::Method::GET, "/agents/1")
            .header("x-api-key", "secret")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = server
            .request(reqwest::Method::GET, "/agents/1")
            .header("x-api-key", "wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403);

        let resp = server.get("/agents/1").await.unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn public_prefix_needs_no_key() {
        let server = auth_server(0, Duration::from_secs(60)).await;

        let resp = server.get("/health").await.unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn fixed_window_allows_then_blocks_then_resets() {
        let server = auth_server(3, Duration::from_millis(400)).await;

        for _ in 0..3 {
            let resp = server
                .request(reqwest::Method::GET, "/agents/1")
                .header("x-api-key", "secret")
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
        }

        let resp = server
            .request(reqwest::Method::GET, "/agents/1")
            .header("x-api-key", "secret")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 429);
        assert_eq!(
            resp.headers().get("x-ratelimit-remaining").unwrap(),
            "0"
        );
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["retry_after"].as_u64().unwrap() > 0);

        // A fresh window admits requests again.
        tokio::time::sleep(Duration::from_millis(500)).await;
        let resp = server
            .request(reqwest::Method::GET, "/agents/1")
            .header("x-api-key", "secret")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn rate_limit_headers_present_on_success() {
        let server = auth_server(5, Duration::from_secs(60)).await;

        let resp = server
            .request(reqwest::Method::GET, "/agents/1")
            .header("x-api-key", "secret")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("x-ratelimit-limit").unwrap(), "5");
        assert_eq!(resp.headers().get("x-ratelimit-remaining").unwrap(), "4");
    }

    // === Namespace extraction ===

    async fn namespace_server() -> TestServer {
        let mut server = routes_only();
        server.wrap(NamespaceExtractor::new(NamespaceConfig::default()));
        server.wrap(EnsureNamespace::new(Arc::new(InMemoryTenantRegistry::new())));
        TestServer::spawn(server).await.unwrap()
    }

    #[tokio::test]
    async fn namespace_header_is_extracted() {
        let server = namespace_server().await;

        let resp = server
            .request(reqwest::Method::POST, "/memories")
            .header("content-type", "application/json")
            .header("x-namespace", "team-1")
            .body(r#"{"q":"x"}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["namespace"], "team-1");
        // Back-filled into the body for downstream handlers.
        assert_eq!(body["body"]["user_id"], "team-1");
    }

    #[tokio::test]
    async fn invalid_namespace_is_400() {
        let server = namespace_server().await;

        let resp = server
            .request(reqwest::Method::POST, "/memories")
            .header("x-namespace", "bad space")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("bad space"));
    }

    #[tokio::test]
    async fn missing_namespace_is_400() {
        let server = namespace_server().await;

        let resp = server
            .request(reqwest::Method::POST, "/memories")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn strict_tenants_reject_unknown_namespaces() {
        let mut server = routes_only();
        server.wrap(NamespaceExtractor::new(NamespaceConfig::default()));
        server.wrap(RequireNamespace::new(Arc::new(
            InMemoryTenantRegistry::with_tenants(["known"]),
        )));
        let server = TestServer::spawn(server).await.unwrap();

        let resp = server
            .request(reqwest::Method::POST, "/memories")
            .header("x-namespace", "known")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let resp = server
            .request(reqwest::Method::POST, "/memories")
            .header("x-namespace", "unknown")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    // === Static files ===

    #[tokio::test]
    async fn static_files_serve_and_traversal_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("index.html")).unwrap();
        f.write_all(b"<html>dashboard</html>").unwrap();

        let mut server = routes_only();
        server.wrap(StaticDir::mount("/dashboard", dir.path()));
        let server = TestServer::spawn(server).await.unwrap();

        let resp = server.get("/dashboard/index.html").await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/html"
        );
        assert_eq!(resp.text().await.unwrap(), "<html>dashboard</html>");

        // Traversal never serves file content; it falls through to 404.
        let response = server
            .raw_get("/dashboard/../../etc/passwd")
            .await
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);
        assert!(response.ends_with("404: Not Found"));

        let response = server
            .raw_get("/dashboard/%2e%2e/%2e%2e/etc/passwd")
            .await
            .unwrap();
        assert!(response.starts_with("HTTP/1.1 404"), "got: {}", response);
    }

    // === WebSocket ===

    fn ws_server() -> Server {
        let mut server = routes_only();
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
        server
    }

    #[tokio::test]
    async fn ws_echo_round_trip() {
        let server = TestServer::spawn(ws_server()).await.unwrap();

        let mut ws = server.ws_connect("/ws/echo").await.unwrap();
        ws.send(Message::Text("hello".into())).await.unwrap();

        match ws.next().await {
            Some(Ok(Message::Text(text))) => assert_eq!(text, "hello"),
            other => panic!("expected echoed text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ws_upgrade_to_unregistered_path_destroys_socket() {
        let server = TestServer::spawn(ws_server()).await.unwrap();

        // The server aborts the connection without a handshake; the
        // client sees a connection-level failure, not an HTTP status.
        let result = server.ws_connect("/ws/unregistered").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn ws_query_reaches_handler() {
        let mut server = base_server();
        server.ws("/ws/greet", |mut ws, req| async move {
            let name = req
                .query
                .get("name")
                .cloned()
                .unwrap_or_else(|| "anonymous".to_string());
            let _ = ws.send(Message::Text(format!("hello {}", name))).await;
        });
        let server = TestServer::spawn(server).await.unwrap();

        let mut ws = server.ws_connect("/ws/greet?name=ada").await.unwrap();
        match ws.next().await {
            Some(Ok(Message::Text(text))) => assert_eq!(text, "hello ada"),
            other => panic!("expected greeting, got {:?}", other),
        }
    }

    // === Middleware interplay ===

    #[tokio::test]
    async fn pipeline_runs_in_registration_order() {
        // Static files are registered ahead of auth, so the dashboard
        // is reachable without a key while API routes are not.
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("app.js")).unwrap();
        f.write_all(b"js").unwrap();

        let mut server = routes_only();
        server.wrap(StaticDir::mount("/dashboard", dir.path()));
        server.wrap(
            ApiKeyAuth::new(auth_config("secret", 0, Duration::from_secs(60))).unwrap(),
        );
        let server = TestServer::spawn(server).await.unwrap();

        let resp = server.get("/dashboard/app.js").await.unwrap();
        assert_eq!(resp.status(), 200);

        let resp = server.get("/agents/1").await.unwrap();
        assert_eq!(resp.status(), 401);
    }

    #[tokio::test]
    async fn handler_error_is_500_with_message() {
        let mut server = base_server();
        server.get("/boom", |_ctx| async {
            Err(memgate_lib::ApiError::Internal("storage offline".to_string()))
        });
        let server = TestServer::spawn(server).await.unwrap();

        let resp = server.get("/boom").await.unwrap();
        assert_eq!(resp.status(), 500);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "storage offline");
    }
}
