//! Session middleware: binds each request to its browser session.

use crate::{
    chat::{SessionId, SessionStore},
    context::Context,
    middleware::{BoxResponse, Middleware, Next},
};

/// Name of the cookie carrying the [`SessionId`].
pub const SESSION_COOKIE: &str = "cotbot_session";

/// Resolves the session cookie to a live session and stores its
/// [`SessionHandle`](crate::chat::SessionHandle) in the context extensions.
///
/// # Behavior
///
/// - A cookie naming a live session reuses that session.
/// - A missing, malformed, or expired cookie gets a fresh session, and the
///   response carries a `Set-Cookie` header for it.
///
/// # Examples
///
/// ```rust,no_run
/// use cotbot::chat::{SessionDefaults, SessionStore};
/// use cotbot::llm::Provider;
/// use cotbot::middleware::SessionMiddleware;
///
/// let store = SessionStore::new(SessionDefaults::new(Provider::OpenAi));
/// let sessions = SessionMiddleware::new(store);
/// ```
pub struct SessionMiddleware {
    store: SessionStore,
}

impl SessionMiddleware {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }
}

fn set_cookie(id: SessionId) -> String {
    format!("{SESSION_COOKIE}={id}; Path=/; HttpOnly; SameSite=Lax")
}

impl Middleware for SessionMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxResponse {
        let store = self.store.clone();
        Box::pin(async move {
            let requested = ctx
                .request()
                .headers()
                .cookie(SESSION_COOKIE)
                .and_then(|value| value.parse::<SessionId>().ok());

            let existing = match requested {
                Some(id) => store.get(id).await,
                None => None,
            };
            let (session, created) = match existing {
                Some(session) => (session, false),
                None => (store.create().await, true),
            };

            let id = session.id();
            ctx.extensions_mut().insert(session);
            let mut response = next.run(ctx).await;
            if created {
                response.add_header("Set-Cookie", set_cookie(id));
            }
            response
        })
    }
}
