//! Middleware pipeline: composable before/after request handler logic.
//!
//! A [`Pipeline`] runs an ordered stack of [`Middleware`] in front of a
//! [`Router`]. Each middleware receives the [`Context`] and a [`Next`] cursor and
//! may pass through, short-circuit, or decorate the downstream response.
//!
//! - [`LoggerMiddleware`]: one `tracing` line per request.
//! - [`SessionMiddleware`]: attaches the caller's chat session to the context.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Request, Response, context::Context, router::Router};

mod session;

pub use session::{SESSION_COOKIE, SessionMiddleware};

/// Future returned by middleware.
pub type BoxResponse = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> BoxResponse + Send + Sync + 'static>;

fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// Consumed by [`Next::run`], so each middleware can forward at most once.
/// When the stack is exhausted the request is dispatched to the router.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    endpoint: Arc<Router>,
    index: usize,
}

impl Next {
    /// Invokes the next middleware, or the router once the stack is exhausted.
    pub async fn run(mut self, ctx: Context) -> Response {
        match self.middlewares.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(ctx, self).await
            }
            None => self.endpoint.dispatch(ctx).await,
        }
    }
}

/// The core middleware trait.
///
/// Implementations must be `Send + Sync` because the pipeline is shared across
/// Tokio tasks, and must not hold `&mut` references to shared state across an
/// `.await` point.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse;
}

/// An ordered middleware stack terminated by a router.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use cotbot::middleware::{LoggerMiddleware, Pipeline};
/// use cotbot::Router;
///
/// let pipeline = Pipeline::new(Router::new()).with(LoggerMiddleware);
/// let pipeline = Arc::new(pipeline);
/// ```
pub struct Pipeline {
    middlewares: Arc<[MiddlewareHandler]>,
    endpoint: Arc<Router>,
}

impl Pipeline {
    pub fn new(router: Router) -> Self {
        Self {
            middlewares: Arc::from(Vec::new()),
            endpoint: Arc::new(router),
        }
    }

    /// Appends `middleware`; earlier middleware runs first.
    #[must_use]
    pub fn with<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        let mut stack = self.middlewares.to_vec();
        stack.push(from_middleware(Arc::new(middleware)));
        self.middlewares = stack.into();
        self
    }

    /// Runs `request` through the stack.
    pub async fn handle(&self, request: Request) -> Response {
        let next = Next {
            middlewares: Arc::clone(&self.middlewares),
            endpoint: Arc::clone(&self.endpoint),
            index: 0,
        };
        next.run(Context::new(request)).await
    }
}

/// Logs method, path, response status, and elapsed time of each request.
///
/// Timing covers the handler only; a streamed body keeps flowing afterwards.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            tracing::info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                elapsed = ?start.elapsed(),
                "request handled"
            );

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
            let tag = self.0;
            Box::pin(async move {
                let mut response = next.run(ctx).await;
                response.add_header("X-Trace", tag);
                response
            })
        }
    }

    struct Reject;

    impl Middleware for Reject {
        fn handle(&self, _ctx: Context, _next: Next) -> BoxResponse {
            Box::pin(async { Response::new(StatusCode::Conflict) })
        }
    }

    fn request(path: &str) -> Request {
        let raw = format!("GET {path} HTTP/1.1\r\n\r\n");
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn router() -> Router {
        let mut router = Router::new();
        router.get("/ok", |_ctx| async { Response::new(StatusCode::Ok) });
        router
    }

    #[tokio::test]
    async fn empty_stack_reaches_router() {
        let pipeline = Pipeline::new(router());
        assert_eq!(pipeline.handle(request("/ok")).await.status(), StatusCode::Ok);
        assert_eq!(
            pipeline.handle(request("/missing")).await.status(),
            StatusCode::NotFound
        );
    }

    #[tokio::test]
    async fn middleware_wraps_in_registration_order() {
        let pipeline = Pipeline::new(router())
            .with(LoggerMiddleware)
            .with(Tag("outer"))
            .with(Tag("inner"));
        let response = pipeline.handle(request("/ok")).await;
        let tags: Vec<_> = response.headers().get_all("x-trace").collect();
        assert_eq!(tags, vec!["inner", "outer"]);
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let pipeline = Pipeline::new(router()).with(Reject).with(Tag("never"));
        let response = pipeline.handle(request("/ok")).await;
        assert_eq!(response.status(), StatusCode::Conflict);
        assert!(!response.headers().contains("x-trace"));
    }
}
