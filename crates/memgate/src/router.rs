//! Route tables: HTTP method + path-pattern matching with parameter
//! extraction, and the separate exact-match WebSocket table.
//!
//! Matching is first-match-wins in registration order. A match
//! requires the pattern and the request path to have the same segment
//! count; there are no multi-segment wildcards.

use std::collections::BTreeMap;

use hyper::Method;

use crate::pipeline::{Handler, WsHandler};

/// Method dimension of a route: a specific verb, or any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodFilter {
    All,
    Only(Method),
}

impl MethodFilter {
    fn matches(&self, method: &Method) -> bool {
        match self {
            MethodFilter::All => true,
            MethodFilter::Only(m) => m == method,
        }
    }

    fn label(&self) -> String {
        match self {
            MethodFilter::All => "ALL".to_string(),
            MethodFilter::Only(m) => m.to_string(),
        }
    }
}

/// A parsed pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    /// Named parameter (`:id`), binds any single path segment.
    Param(String),
}

/// A registered route.
pub struct RouteEntry {
    method: MethodFilter,
    /// Original pattern string, kept for introspection.
    pattern: String,
    segments: Vec<Segment>,
    handler: Handler,
}

/// Ordered route table. Registration order is significant and
/// preserved; the table is immutable once the server starts serving.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<RouteEntry>,
}

/// A successful lookup: the handler plus bound path parameters.
pub struct RouteMatch {
    pub handler: Handler,
    pub params: BTreeMap<String, String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route.
    ///
    /// Pattern segments prefixed with `:` bind parameters, e.g.
    /// `/agents/:id/memories`.
    pub fn insert(&mut self, method: MethodFilter, pattern: &str, handler: Handler) {
        let segments = parse_pattern(pattern);
        self.routes.push(RouteEntry {
            method,
            pattern: pattern.to_string(),
            segments,
            handler,
        });
    }

    /// Find the first entry matching the method and path, binding
    /// URL-decoded parameter values. O(routes × segments).
    pub fn lookup(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let segments: Vec<&str> = split_path(path);

        for route in &self.routes {
            if !route.method.matches(method) {
                continue;
            }
            if let Some(params) = match_segments(&route.segments, &segments) {
                return Some(RouteMatch {
                    handler: route.handler.clone(),
                    params,
                });
            }
        }

        None
    }

    /// Method label → registered patterns, for introspection tooling.
    pub fn patterns(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for route in &self.routes {
            map.entry(route.method.label())
                .or_default()
                .push(route.pattern.clone());
        }
        map
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Exact-path WebSocket route table.
///
/// Distinct from [`RouteTable`]: no parameters, no prefix matching, no
/// method dimension; upgrade requests have no verb semantics here.
#[derive(Default)]
pub struct WsRouteTable {
    routes: Vec<(String, WsHandler)>,
}

impl WsRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, handler: WsHandler) {
        self.routes.push((path.to_string(), handler));
    }

    pub fn lookup(&self, path: &str) -> Option<WsHandler> {
        self.routes
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, h)| h.clone())
    }

    pub fn paths(&self) -> Vec<String> {
        self.routes.iter().map(|(p, _)| p.clone()).collect()
    }
}

/// Split a path on `/`, discarding empty segments.
fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Parse a pattern into segments. `:name` marks a parameter.
fn parse_pattern(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            if let Some(name) = s.strip_prefix(':') {
                Segment::Param(name.to_string())
            } else {
                Segment::Static(s.to_string())
            }
        })
        .collect()
}

/// Match pattern segments against path segments.
///
/// Literals compare exactly (case-sensitive, undecoded); parameters
/// bind the URL-decoded segment value. Segment counts must be equal.
fn match_segments(pattern: &[Segment], path: &[&str]) -> Option<BTreeMap<String, String>> {
    if pattern.len() != path.len() {
        return None;
    }

    let mut params = BTreeMap::new();
    for (segment, value) in pattern.iter().zip(path) {
        match segment {
            Segment::Static(literal) => {
                if literal != value {
                    return None;
                }
            }
            Segment::Param(name) => {
                let decoded = urlencoding::decode(value)
                    .map(|d| d.into_owned())
                    .unwrap_or_else(|_| (*value).to_string());
                params.insert(name.clone(), decoded);
            }
        }
    }

    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::into_handler;
    use crate::request::Reply;

    fn handler(tag: &'static str) -> Handler {
        into_handler(move |_ctx| async move { Ok(Reply::new().text(tag)) })
    }

    fn table(routes: &[(MethodFilter, &str)]) -> RouteTable {
        let mut table = RouteTable::new();
        for (method, pattern) in routes {
            table.insert(method.clone(), pattern, handler("route"));
        }
        table
    }

    #[test]
    fn static_path_matches() {
        let table = table(&[(MethodFilter::Only(Method::GET), "/health")]);

        let matched = table.lookup(&Method::GET, "/health");
        assert!(matched.is_some());
        assert!(matched.unwrap().params.is_empty());
    }

    #[test]
    fn method_must_match() {
        let table = table(&[(MethodFilter::Only(Method::GET), "/memories")]);

        assert!(table.lookup(&Method::GET, "/memories").is_some());
        assert!(table.lookup(&Method::POST, "/memories").is_none());
    }

    #[test]
    fn all_matches_any_method() {
        let table = table(&[(MethodFilter::All, "/memories")]);

        assert!(table.lookup(&Method::GET, "/memories").is_some());
        assert!(table.lookup(&Method::DELETE, "/memories").is_some());
    }

    #[test]
    fn parameter_binds_segment() {
        let table = table(&[(MethodFilter::Only(Method::GET), "/agents/:id")]);

        let matched = table.lookup(&Method::GET, "/agents/42").expect("match");
        assert_eq!(matched.params.get("id"), Some(&"42".to_string()));
    }

    #[test]
    fn parameter_is_url_decoded() {
        let table = table(&[(MethodFilter::Only(Method::GET), "/agents/:id")]);

        let matched = table
            .lookup(&Method::GET, "/agents/team%20one")
            .expect("match");
        assert_eq!(matched.params.get("id"), Some(&"team one".to_string()));
    }

    #[test]
    fn multiple_parameters_bind() {
        let table = table(&[(
            MethodFilter::Only(Method::GET),
            "/agents/:agentId/memories/:memoryId",
        )]);

        let matched = table
            .lookup(&Method::GET, "/agents/a1/memories/m9")
            .expect("match");
        assert_eq!(matched.params.get("agentId"), Some(&"a1".to_string()));
        assert_eq!(matched.params.get("memoryId"), Some(&"m9".to_string()));
    }

    #[test]
    fn segment_count_must_be_equal() {
        let table = table(&[(MethodFilter::Only(Method::GET), "/agents/:id")]);

        assert!(table.lookup(&Method::GET, "/agents").is_none());
        assert!(table.lookup(&Method::GET, "/agents/42/memories").is_none());
    }

    #[test]
    fn literals_are_case_sensitive() {
        let table = table(&[(MethodFilter::Only(Method::GET), "/Agents")]);

        assert!(table.lookup(&Method::GET, "/Agents").is_some());
        assert!(table.lookup(&Method::GET, "/agents").is_none());
    }

    #[test]
    fn first_match_wins_in_registration_order() {
        let mut table = RouteTable::new();
        table.insert(MethodFilter::Only(Method::GET), "/agents/:id", handler("param"));
        table.insert(MethodFilter::Only(Method::GET), "/agents/me", handler("static"));

        // The param route was registered first, so it shadows the
        // static route for a single segment.
        let matched = table.lookup(&Method::GET, "/agents/me").expect("match");
        assert_eq!(matched.params.get("id"), Some(&"me".to_string()));
    }

    #[test]
    fn no_match_on_exhausted_table() {
        let table = table(&[(MethodFilter::Only(Method::GET), "/memories")]);
        assert!(table.lookup(&Method::GET, "/nope").is_none());
    }

    #[test]
    fn empty_segments_are_discarded() {
        let table = table(&[(MethodFilter::Only(Method::GET), "/agents/:id")]);
        assert!(table.lookup(&Method::GET, "/agents//42").is_some());
        assert!(table.lookup(&Method::GET, "/agents/42/").is_some());
    }

    #[test]
    fn patterns_groups_by_method() {
        let mut table = RouteTable::new();
        table.insert(MethodFilter::Only(Method::GET), "/health", handler("h"));
        table.insert(MethodFilter::Only(Method::GET), "/agents/:id", handler("a"));
        table.insert(MethodFilter::Only(Method::POST), "/memories", handler("m"));
        table.insert(MethodFilter::All, "/anything", handler("x"));

        let patterns = table.patterns();
        assert_eq!(
            patterns.get("GET"),
            Some(&vec!["/health".to_string(), "/agents/:id".to_string()])
        );
        assert_eq!(patterns.get("POST"), Some(&vec!["/memories".to_string()]));
        assert_eq!(patterns.get("ALL"), Some(&vec!["/anything".to_string()]));
    }

    #[test]
    fn ws_table_is_exact_match_only() {
        let mut table = WsRouteTable::new();
        table.insert(
            "/ws/stream",
            crate::pipeline::into_ws_handler(|_ws, _req| async {}),
        );

        assert!(table.lookup("/ws/stream").is_some());
        assert!(table.lookup("/ws/stream/extra").is_none());
        assert!(table.lookup("/ws").is_none());
        assert!(table.lookup("/ws/stream/").is_none());
    }
}
