// src/router.rs
//
// Segment tree over path components. Three child kinds per node with fixed
// matching precedence: literal > parameter (`{name}`) > wildcard (`*rest`).
// The tree is immutable once the server runs; registration happens during
// setup on the owning thread.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ServerError, ServerResult};
use crate::method::{Method, ROUTABLE_METHODS};
use crate::request::Request;
use crate::response::Response;
use crate::writer::ResponseWriter;

pub type Handler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;
pub type StreamingHandler = Arc<dyn Fn(&Request, &mut ResponseWriter) + Send + Sync>;

/// A handler slot is buffered or streaming, never both.
#[derive(Clone)]
pub enum RouteTarget {
    Buffered(Handler),
    Streaming(StreamingHandler),
}

impl RouteTarget {
    fn kind(&self) -> &'static str {
        match self {
            RouteTarget::Buffered(_) => "buffered",
            RouteTarget::Streaming(_) => "streaming",
        }
    }
}

#[derive(Clone, Default)]
struct Node {
    /// Literal children in insertion order; first match wins which keeps
    /// lookups deterministic for sibling prefixes.
    literals: Vec<(String, Node)>,
    param: Option<Box<(String, Node)>>,
    wildcard: Option<Box<(String, Node)>>,
    handlers: HashMap<Method, RouteTarget>,
}

impl Node {
    fn method_mask(&self) -> u16 {
        self.handlers.keys().fold(0, |mask, m| mask | m.bit())
    }
}

/// Outcome of a route lookup.
pub enum Lookup<'r, 'p> {
    Found {
        target: &'r RouteTarget,
        params: Vec<(&'r str, &'p str)>,
    },
    /// Path exists with other methods; carries the `Allow` mask.
    MethodMissing(u16),
    NotFound,
}

#[derive(Clone, Default)]
pub struct Router {
    root: Node,
    fallback: Option<RouteTarget>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a buffered handler. Panics on a conflicting registration;
    /// use [`Router::try_route`] to handle the error instead.
    pub fn route<F>(&mut self, method: Method, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.try_route(method, path, handler).expect("route registration failed");
        self
    }

    pub fn try_route<F>(&mut self, method: Method, path: &str, handler: F) -> ServerResult<()>
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.insert(method, path, RouteTarget::Buffered(Arc::new(handler)))
    }

    /// Register a streaming handler for `path`.
    pub fn route_streaming<F>(&mut self, method: Method, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request, &mut ResponseWriter) + Send + Sync + 'static,
    {
        self.try_route_streaming(method, path, handler)
            .expect("route registration failed");
        self
    }

    pub fn try_route_streaming<F>(&mut self, method: Method, path: &str, handler: F) -> ServerResult<()>
    where
        F: Fn(&Request, &mut ResponseWriter) + Send + Sync + 'static,
    {
        self.insert(method, path, RouteTarget::Streaming(Arc::new(handler)))
    }

    /// Fallback invoked when no route matches (instead of the builtin 404).
    pub fn set_fallback<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.fallback = Some(RouteTarget::Buffered(Arc::new(handler)));
        self
    }

    pub fn get<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Get, path, handler)
    }

    pub fn post<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Post, path, handler)
    }

    pub fn put<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Put, path, handler)
    }

    pub fn delete<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Delete, path, handler)
    }

    pub fn patch<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Patch, path, handler)
    }

    pub fn head<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Head, path, handler)
    }

    pub fn options<F>(&mut self, path: &str, handler: F) -> &mut Self
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.route(Method::Options, path, handler)
    }

    fn insert(&mut self, method: Method, path: &str, target: RouteTarget) -> ServerResult<()> {
        if method == Method::Unknown {
            return Err(ServerError::Route("cannot register the Unknown method".into()));
        }
        if !path.starts_with('/') {
            return Err(ServerError::Route(format!("path `{path}` must start with '/'")));
        }

        let segments = split_registration(path);
        let mut node = &mut self.root;
        for (i, seg) in segments.iter().enumerate() {
            match seg {
                Segment::Literal(lit) => {
                    let pos = node.literals.iter().position(|(l, _)| l == lit);
                    let idx = match pos {
                        Some(idx) => idx,
                        None => {
                            node.literals.push((lit.to_string(), Node::default()));
                            node.literals.len() - 1
                        }
                    };
                    node = &mut node.literals[idx].1;
                }
                Segment::Param(name) => {
                    let entry = node
                        .param
                        .get_or_insert_with(|| Box::new((name.to_string(), Node::default())));
                    if entry.0 != *name {
                        return Err(ServerError::Route(format!(
                            "conflicting parameter names `{{{}}}` and `{{{}}}` at `{path}`",
                            entry.0, name
                        )));
                    }
                    node = &mut entry.1;
                }
                Segment::Wildcard(name) => {
                    if i + 1 != segments.len() {
                        return Err(ServerError::Route(format!(
                            "wildcard must be the final segment in `{path}`"
                        )));
                    }
                    let entry = node
                        .wildcard
                        .get_or_insert_with(|| Box::new((name.to_string(), Node::default())));
                    node = &mut entry.1;
                }
            }
        }

        if let Some(existing) = node.handlers.get(&method) {
            if existing.kind() != target.kind() {
                return Err(ServerError::Route(format!(
                    "`{} {path}` already registered as a {} handler",
                    method,
                    existing.kind()
                )));
            }
        }
        node.handlers.insert(method, target);
        Ok(())
    }

    /// Match `path` (already percent-decoded) for `method`.
    pub fn lookup<'r, 'p>(&'r self, method: Method, path: &'p str) -> Lookup<'r, 'p> {
        let segments = split_lookup(path);
        let mut params = Vec::new();
        if let Some(target) = match_node(&self.root, method, &segments, 0, path, &mut params) {
            return Lookup::Found { target, params };
        }
        let allow = allowed_mask(&self.root, &segments, 0);
        if allow != 0 {
            return Lookup::MethodMissing(allow);
        }
        if let Some(fallback) = &self.fallback {
            return Lookup::Found {
                target: fallback,
                params: Vec::new(),
            };
        }
        Lookup::NotFound
    }

    /// Union of methods registered for `path`, as an `Allow` mask.
    pub fn allowed_methods(&self, path: &str) -> u16 {
        let segments = split_lookup(path);
        allowed_mask(&self.root, &segments, 0)
    }

    /// Union of every method advertised anywhere in the tree (`OPTIONS *`).
    pub fn advertised_methods(&self) -> u16 {
        fn walk(node: &Node, mask: &mut u16) {
            *mask |= node.method_mask();
            for (_, child) in &node.literals {
                walk(child, mask);
            }
            if let Some(param) = &node.param {
                walk(&param.1, mask);
            }
            if let Some(wildcard) = &node.wildcard {
                walk(&wildcard.1, mask);
            }
        }
        let mut mask = 0;
        walk(&self.root, &mut mask);
        mask
    }

    pub fn has_routes(&self) -> bool {
        self.advertised_methods() != 0 || self.fallback.is_some()
    }
}

/// Render an `Allow` mask as a header value.
pub fn format_allow(mask: u16) -> String {
    let mut out = String::new();
    for m in ROUTABLE_METHODS {
        if mask & m.bit() != 0 {
            if !out.is_empty() {
                out.push_str(", ");
            }
            out.push_str(m.as_str());
        }
    }
    out
}

enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
    Wildcard(&'a str),
}

/// Split a registration pattern. A trailing slash yields a final empty
/// literal so `/x` and `/x/` occupy distinct nodes under Strict policy.
fn split_registration(path: &str) -> Vec<Segment<'_>> {
    let trimmed = &path[1..];
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed
        .split('/')
        .map(|seg| {
            if let Some(name) = seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Segment::Param(name)
            } else if let Some(name) = seg.strip_prefix('*') {
                Segment::Wildcard(if name.is_empty() { "*" } else { name })
            } else {
                Segment::Literal(seg)
            }
        })
        .collect()
}

/// Split a request path into (segment, byte offset) pairs. The offset lets
/// wildcards capture the raw remainder including slashes.
fn split_lookup(path: &str) -> Vec<(&str, usize)> {
    let body = path.strip_prefix('/').unwrap_or(path);
    if body.is_empty() {
        return Vec::new();
    }
    let base = path.len() - body.len();
    let mut out = Vec::new();
    let mut start = 0;
    for (i, b) in body.bytes().enumerate() {
        if b == b'/' {
            out.push((&body[start..i], base + start));
            start = i + 1;
        }
    }
    out.push((&body[start..], base + start));
    out
}

fn match_node<'r, 'p>(
    node: &'r Node,
    method: Method,
    segments: &[(&'p str, usize)],
    depth: usize,
    path: &'p str,
    params: &mut Vec<(&'r str, &'p str)>,
) -> Option<&'r RouteTarget> {
    if depth == segments.len() {
        return node.handlers.get(&method);
    }
    let (segment, offset) = segments[depth];

    for (literal, child) in &node.literals {
        if literal == segment {
            if let Some(target) = match_node(child, method, segments, depth + 1, path, params) {
                return Some(target);
            }
            break;
        }
    }

    if let Some(param) = &node.param {
        let before = params.len();
        params.push((param.0.as_str(), segment));
        if let Some(target) = match_node(&param.1, method, segments, depth + 1, path, params) {
            return Some(target);
        }
        params.truncate(before);
    }

    if let Some(wildcard) = &node.wildcard {
        params.push((wildcard.0.as_str(), &path[offset..]));
        if let Some(target) = wildcard.1.handlers.get(&method) {
            return Some(target);
        }
        params.pop();
    }

    None
}

fn allowed_mask(node: &Node, segments: &[(&str, usize)], depth: usize) -> u16 {
    if depth == segments.len() {
        return node.method_mask();
    }
    let (segment, _) = segments[depth];
    let mut mask = 0;
    for (literal, child) in &node.literals {
        if literal == segment {
            mask |= allowed_mask(child, segments, depth + 1);
            break;
        }
    }
    if let Some(param) = &node.param {
        mask |= allowed_mask(&param.1, segments, depth + 1);
    }
    if let Some(wildcard) = &node.wildcard {
        mask |= wildcard.1.method_mask();
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_echo(req: &Request) -> Response {
        Response::ok(req.path().to_string())
    }

    fn found<'r, 'p>(lookup: Lookup<'r, 'p>) -> Vec<(&'r str, &'p str)> {
        match lookup {
            Lookup::Found { params, .. } => params,
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn test_static_match() {
        let mut router = Router::new();
        router.get("/hello/world", handler_echo);
        assert!(matches!(router.lookup(Method::Get, "/hello/world"), Lookup::Found { .. }));
        assert!(matches!(router.lookup(Method::Get, "/hello"), Lookup::NotFound));
        assert!(matches!(
            router.lookup(Method::Post, "/hello/world"),
            Lookup::MethodMissing(_)
        ));
    }

    #[test]
    fn test_param_capture() {
        let mut router = Router::new();
        router.get("/users/{id}/posts/{post_id}", handler_echo);
        let params = found(router.lookup(Method::Get, "/users/42/posts/abc"));
        assert_eq!(params, vec![("id", "42"), ("post_id", "abc")]);
    }

    #[test]
    fn test_wildcard_captures_remainder_with_slashes() {
        let mut router = Router::new();
        router.get("/assets/*path", handler_echo);
        let params = found(router.lookup(Method::Get, "/assets/js/app.js"));
        assert_eq!(params, vec![("path", "js/app.js")]);
    }

    #[test]
    fn test_precedence_literal_param_wildcard() {
        let mut router = Router::new();
        router.get("/v/{x}", |_req| Response::ok("param"));
        router.get("/v/fixed", |_req| Response::ok("literal"));
        router.get("/v/*rest", |_req| Response::ok("wild"));

        match router.lookup(Method::Get, "/v/fixed") {
            Lookup::Found { params, .. } => assert!(params.is_empty()),
            _ => panic!(),
        }
        let params = found(router.lookup(Method::Get, "/v/other"));
        assert_eq!(params, vec![("x", "other")]);
        let params = found(router.lookup(Method::Get, "/v/a/b"));
        assert_eq!(params, vec![("rest", "a/b")]);
    }

    #[test]
    fn test_param_backtracks_to_wildcard() {
        let mut router = Router::new();
        router.get("/files/{name}/meta", handler_echo);
        router.get("/files/*rest", handler_echo);
        // `{name}` matches "a" but has no `/meta` continuation for "b",
        // so matching falls back to the wildcard.
        let params = found(router.lookup(Method::Get, "/files/a/b"));
        assert_eq!(params, vec![("rest", "a/b")]);
    }

    #[test]
    fn test_root_route() {
        let mut router = Router::new();
        router.get("/", handler_echo);
        assert!(matches!(router.lookup(Method::Get, "/"), Lookup::Found { .. }));
    }

    #[test]
    fn test_trailing_slash_distinct_nodes() {
        let mut router = Router::new();
        router.get("/gamma", handler_echo);
        assert!(matches!(router.lookup(Method::Get, "/gamma"), Lookup::Found { .. }));
        assert!(matches!(router.lookup(Method::Get, "/gamma/"), Lookup::NotFound));
    }

    #[test]
    fn test_allowed_methods_union() {
        let mut router = Router::new();
        router.get("/thing", handler_echo);
        router.post("/thing", handler_echo);
        router.delete("/thing", handler_echo);
        let mask = router.allowed_methods("/thing");
        assert_eq!(format_allow(mask), "GET, POST, DELETE");
    }

    #[test]
    fn test_mixed_handler_kinds_rejected() {
        let mut router = Router::new();
        router.get("/s", handler_echo);
        let err = router.try_route_streaming(Method::Get, "/s", |_req, _w| {});
        assert!(matches!(err, Err(ServerError::Route(_))));
        // Same kind re-registration replaces quietly.
        assert!(router.try_route(Method::Get, "/s", handler_echo).is_ok());
    }

    #[test]
    fn test_wildcard_must_be_last() {
        let mut router = Router::new();
        let err = router.try_route(Method::Get, "/a/*x/b", handler_echo);
        assert!(matches!(err, Err(ServerError::Route(_))));
    }

    #[test]
    fn test_advertised_methods() {
        let mut router = Router::new();
        router.get("/a", handler_echo);
        router.put("/b/{id}", handler_echo);
        let mask = router.advertised_methods();
        assert_eq!(format_allow(mask), "GET, PUT");
    }
}
