//! Request routing: map URL patterns and HTTP methods to handler functions.
//!
//! Three pattern styles are supported:
//!
//! | Pattern              | Example match              | Captured params                 |
//! |----------------------|----------------------------|---------------------------------|
//! | `/api/session`       | `/api/session`             | *(none)*                        |
//! | `/api/models/:id`    | `/api/models/gpt-4`        | `id → "gpt-4"`                  |
//! | `/static/*`          | `/static/app.js`           | `wildcard → "/app.js"`          |
//!
//! Trailing slashes are normalized on both patterns and incoming paths. Routes are
//! matched in registration order; the first route whose method and pattern both
//! match wins. A path that matches only under another method yields `405`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::{Context, PathParams};
use crate::{Method, Request, Response, StatusCode};

/// Type-erased, heap-allocated async handler.
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait through the blanket impl.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter(String),
}

#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Parameterized { segments: Vec<Segment> },
    Wildcard(String),
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

impl Pattern {
    /// Compiles a route pattern: `/*` suffix → wildcard, any `:` → parameterized,
    /// otherwise exact.
    fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Wildcard(prefix.to_string());
        }

        if pattern.contains(':') {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(name) => Segment::Parameter(name.to_string()),
                    None => Segment::Static(s.to_string()),
                })
                .collect();
            return Pattern::Parameterized { segments };
        }

        Pattern::Exact(pattern.to_string())
    }

    fn matches(&self, path: &str) -> Option<PathParams> {
        let path = trim_trailing_slash(path);

        match self {
            Pattern::Exact(p) => (p == path).then(PathParams::new),
            Pattern::Parameterized { segments } => {
                let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                if segments.len() != path_segments.len() {
                    return None;
                }

                let mut params = PathParams::new();
                for (seg, path_seg) in segments.iter().zip(path_segments) {
                    match seg {
                        Segment::Static(s) if s != path_seg => return None,
                        Segment::Static(_) => {}
                        Segment::Parameter(name) => {
                            params.insert(name.clone(), path_seg.to_string());
                        }
                    }
                }
                Some(params)
            }
            Pattern::Wildcard(prefix) => {
                let suffix = path.strip_prefix(prefix.as_str())?;
                if !suffix.is_empty() && !suffix.starts_with('/') {
                    return None;
                }
                let mut params = PathParams::new();
                params.insert("wildcard".to_string(), suffix.to_string());
                Some(params)
            }
        }
    }
}

struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
}

/// HTTP request router.
///
/// # Examples
///
/// ```rust,no_run
/// use cotbot::{Router, Response, StatusCode};
/// use cotbot::context::Context;
///
/// let mut router = Router::new();
/// router.get("/api/models/:id", |ctx: Context| async move {
///     let id = ctx.params().get("id").unwrap_or_default().to_owned();
///     Response::new(StatusCode::Ok).body(id)
/// });
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Get, path, handler);
    }

    pub fn post(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Post, path, handler);
    }

    pub fn put(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(Method::Put, path, handler);
    }

    fn add_route(&mut self, method: Method, path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |ctx| handler.call(ctx));
        self.routes.push(Route {
            method,
            pattern: Pattern::parse(path),
            handler,
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatches a bare request.
    pub async fn route(&self, request: Request) -> Response {
        self.dispatch(Context::new(request)).await
    }

    /// Dispatches a context that middleware may already have decorated.
    ///
    /// Returns `404` when no pattern matches and `405` when a pattern matches
    /// only under a different method.
    pub async fn dispatch(&self, mut ctx: Context) -> Response {
        let mut path_matched = false;

        for route in &self.routes {
            let Some(params) = route.pattern.matches(ctx.request().path()) else {
                continue;
            };
            if &route.method != ctx.request().method() {
                path_matched = true;
                continue;
            }
            ctx.set_params(params);
            return (route.handler)(ctx).await;
        }

        if path_matched {
            Response::new(StatusCode::MethodNotAllowed)
        } else {
            Response::new(StatusCode::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_request(method: &str, path: &str) -> Request {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    #[test]
    fn pattern_parse_variants() {
        assert!(matches!(Pattern::parse("/"), Pattern::Exact(s) if s == "/"));
        assert!(matches!(Pattern::parse("/api/session/"), Pattern::Exact(s) if s == "/api/session"));
        assert!(matches!(Pattern::parse("/static/*"), Pattern::Wildcard(s) if s == "/static"));
        match Pattern::parse("/api/models/:id") {
            Pattern::Parameterized { segments } => {
                assert_eq!(segments.len(), 3);
                assert!(matches!(&segments[2], Segment::Parameter(s) if s == "id"));
            }
            other => panic!("expected Parameterized, got {other:?}"),
        }
    }

    #[test]
    fn exact_match_normalizes_trailing_slash() {
        let pat = Pattern::parse("/api/session");
        assert!(pat.matches("/api/session/").is_some());
        assert!(pat.matches("/api/sessions").is_none());
    }

    #[test]
    fn parameter_is_captured() {
        let pat = Pattern::parse("/api/models/:id");
        let params = pat.matches("/api/models/gemini-pro").unwrap();
        assert_eq!(params.get("id"), Some("gemini-pro"));
        assert!(pat.matches("/api/models").is_none());
        assert!(pat.matches("/api/other/gemini-pro").is_none());
    }

    #[test]
    fn wildcard_requires_segment_boundary() {
        let pat = Pattern::parse("/static/*");
        let params = pat.matches("/static/js/app.js").unwrap();
        assert_eq!(params.get("wildcard"), Some("/js/app.js"));
        assert!(pat.matches("/staticky").is_none());
    }

    #[tokio::test]
    async fn empty_router_returns_404() {
        let router = Router::new();
        assert!(router.is_empty());
        let res = router.route(make_request("GET", "/")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn wrong_method_returns_405() {
        let mut router = Router::new();
        router.post("/api/clear", |_ctx| async { Response::new(StatusCode::Ok) });
        let res = router.route(make_request("GET", "/api/clear")).await;
        assert_eq!(res.status(), StatusCode::MethodNotAllowed);
    }

    #[tokio::test]
    async fn first_matching_route_wins() {
        let mut router = Router::new();
        router.get("/path", |_ctx| async { Response::new(StatusCode::Ok) });
        router.get("/path", |_ctx| async { Response::new(StatusCode::Accepted) });
        assert_eq!(router.len(), 2);
        let res = router.route(make_request("GET", "/path")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn handler_receives_params() {
        let mut router = Router::new();
        router.put("/api/models/:id", |ctx: Context| async move {
            let id = ctx.params().get("id").unwrap_or("").to_owned();
            Response::new(StatusCode::Ok).body(id)
        });
        let res = router.route(make_request("PUT", "/api/models/gpt-4")).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.full_body(), Some(&b"gpt-4"[..]));
    }
}
