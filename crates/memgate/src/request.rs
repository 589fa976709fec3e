//! Per-request context and response construction.

use std::collections::BTreeMap;
use std::net::IpAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Method, Response, StatusCode};
use uuid::Uuid;

/// The response type produced by handlers and middleware.
pub type HttpResponse = Response<Full<Bytes>>;

/// Mutable per-request record threaded through the middleware pipeline
/// and handed to the matched handler.
///
/// Created by the dispatcher at connection-accept time, owned by the
/// single in-flight request, discarded when the response completes.
#[derive(Debug)]
pub struct RequestContext {
    /// Correlation id for log events.
    pub id: Uuid,
    pub method: Method,
    /// Request path, query string stripped.
    pub path: String,
    /// URL-decoded query parameters.
    pub query: BTreeMap<String, String>,
    /// Bound path parameters. Populated by the route match.
    pub params: BTreeMap<String, String>,
    /// Parsed JSON body, `None` when absent or unparseable.
    pub body: Option<serde_json::Value>,
    pub client_ip: IpAddr,
    /// Host header with port and non-host characters stripped.
    pub hostname: String,
    /// Request headers, names lowercased.
    pub headers: BTreeMap<String, String>,
    /// Validated tenant namespace. Set by the namespace middleware;
    /// downstream code reads it, never mutates it.
    pub namespace: Option<String>,
    response_headers: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new(method: Method, path: String, client_ip: IpAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            method,
            path,
            query: BTreeMap::new(),
            params: BTreeMap::new(),
            body: None,
            client_ip,
            hostname: String::new(),
            headers: BTreeMap::new(),
            namespace: None,
            response_headers: BTreeMap::new(),
        }
    }

    /// Get a request header by (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Stage a header to be set on whatever response this request
    /// eventually produces.
    pub fn set_response_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response_headers.insert(name.into(), value.into());
    }

    /// Headers staged for the response.
    pub fn response_headers(&self) -> &BTreeMap<String, String> {
        &self.response_headers
    }
}

/// Snapshot of an upgrade request handed to WebSocket handlers.
#[derive(Debug, Clone)]
pub struct WsRequest {
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub client_ip: IpAddr,
}

/// Response builder with the helpers the handler contract exposes:
/// status, headers, JSON, plain text, and type-inferring send.
#[derive(Debug, Clone)]
pub struct Reply {
    status: StatusCode,
    headers: BTreeMap<String, String>,
}

impl Default for Reply {
    fn default() -> Self {
        Self::new()
    }
}

impl Reply {
    /// Start a 200 OK reply.
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: BTreeMap::new(),
        }
    }

    /// Start a reply with the given status.
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
        }
    }

    /// Set a response header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_lowercase(), value.into());
        self
    }

    /// Finish with a JSON body.
    pub fn json(mut self, value: &serde_json::Value) -> HttpResponse {
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        self.finish(Bytes::from(value.to_string()))
    }

    /// Finish with a plain-text body, unless a content-type was
    /// already set.
    pub fn text(mut self, body: impl Into<String>) -> HttpResponse {
        self.headers
            .entry("content-type".to_string())
            .or_insert_with(|| "text/plain; charset=utf-8".to_string());
        self.finish(Bytes::from(body.into()))
    }

    /// Finish inferring the representation: strings go out as plain
    /// text (unless a content-type was set), everything else as JSON.
    pub fn send(self, value: serde_json::Value) -> HttpResponse {
        match value {
            serde_json::Value::String(s) => self.text(s),
            other => self.json(&other),
        }
    }

    /// Finish with no body.
    pub fn empty(self) -> HttpResponse {
        self.finish(Bytes::new())
    }

    /// Finish with raw bytes; the caller sets the content-type.
    pub fn bytes(self, body: Bytes) -> HttpResponse {
        self.finish(body)
    }

    fn finish(self, body: Bytes) -> HttpResponse {
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = self.status;
        apply_headers(&mut response, &self.headers);
        response
    }
}

/// Merge string headers onto a response, skipping names or values that
/// are not valid HTTP.
pub fn apply_headers(response: &mut HttpResponse, headers: &BTreeMap<String, String>) {
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
}

/// Parse a raw query string into URL-decoded key/value pairs.
///
/// Keys without values (e.g. `?flag`) map to the empty string.
pub fn parse_query(raw: Option<&str>) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();

    let Some(raw) = raw else {
        return params;
    };

    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        if let Some((key, value)) = pair.split_once('=') {
            if let (Ok(key), Ok(value)) = (urlencoding::decode(key), urlencoding::decode(value)) {
                params.insert(key.into_owned(), value.into_owned());
            }
        } else if let Ok(key) = urlencoding::decode(pair) {
            params.insert(key.into_owned(), String::new());
        }
    }

    params
}

/// Reduce a Host header to a bare hostname: strip the port and any
/// character that cannot appear in a host.
pub fn normalize_hostname(host: &str) -> String {
    host.split(':')
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-')
        .collect()
}
