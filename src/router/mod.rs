//! Request routing: map URL patterns and HTTP methods to handler functions.
//!
//! This module provides [`Router`], which dispatches incoming HTTP requests to handler
//! functions based on the request method and URL path. Two pattern styles are supported:
//!
//! | Pattern        | Example match                                    |
//! |----------------|--------------------------------------------------|
//! | `/api/tickers` | `/api/tickers`                                   |
//! | `/api/proxy/*` | `/api/proxy`, `/api/proxy/swap/v6.0/1/quote`     |
//!
//! Trailing slashes are normalized on both patterns and incoming paths, so `/health/` and
//! `/health` are treated as equivalent. A wildcard prefix only matches on a segment
//! boundary: `/api/proxy/*` matches `/api/proxy` and `/api/proxy/x`, never `/api/proxyx`.
//!
//! Routes are matched in registration order; the first route whose method and pattern both
//! match the incoming request wins. Handlers receive the whole [`Request`], body stream
//! included.

use std::pin::Pin;
use std::sync::Arc;

use crate::{Method, Request, Response, StatusCode};

/// Type-erased, heap-allocated async handler that processes a [`Request`] and returns a
/// [`Response`].
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be cloned and shared across
/// threads without copying the underlying closure.
pub type Handler =
    Arc<dyn Fn(Request) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Request) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait automatically via the blanket impl
/// below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given request, boxing the returned future.
    fn call(&self, request: Request) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, request: Request) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(request))
    }
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
enum Pattern {
    // Matches one exact path string, e.g. `/health`.
    Exact(String),
    // Matches the prefix itself and anything below it, e.g. `/api/proxy/*`.
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
    /// Parse a route pattern string: a trailing `/*` makes it a
    /// [`Pattern::Wildcard`], anything else is [`Pattern::Exact`].
    fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        match pattern.strip_suffix("/*") {
            Some(prefix) => Pattern::Wildcard(prefix.to_string()),
            None => Pattern::Exact(pattern.to_string()),
        }
    }

    fn matches(&self, path: &str) -> bool {
        let path = trim_trailing_slash(path);

        match self {
            Pattern::Exact(p) => p == path,
            Pattern::Wildcard(prefix) => path
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/')),
        }
    }
}

// A single registered route binding a method + pattern to a handler.
struct Route {
    method: Method,
    pattern: Pattern,
    handler: Handler,
}

impl Route {
    fn matches(&self, method: &Method, path: &str) -> bool {
        &self.method == method && self.pattern.matches(path)
    }
}

/// HTTP request router that dispatches requests to registered handler functions.
///
/// When no route matches, a `404 Not Found` response is returned automatically.
///
/// # Examples
///
/// ```rust,no_run
/// use swapgate::{Method, Request, Router, Response, StatusCode};
///
/// let mut router = Router::new();
///
/// router.get("/health", |_req: Request| async { Response::new(StatusCode::Ok) });
///
/// router.methods(&Method::PROXIED, "/api/proxy/*", |req: Request| async move {
///     Response::new(StatusCode::Ok).body(req.path().to_owned())
/// });
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `GET` requests matching `path`.
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.on(Method::Get, path, handler);
    }

    /// Register a handler for one method.
    pub fn on(&mut self, method: Method, path: &str, handler: impl IntoHandler) {
        self.methods(&[method], path, handler);
    }

    /// Register one handler for every method in `methods`.
    ///
    /// The handler is type-erased once and shared by all the resulting routes.
    pub fn methods(&mut self, methods: &[Method], path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |request| handler.call(request));
        let pattern = Pattern::parse(path);
        for method in methods {
            self.routes.push(Route {
                method: method.clone(),
                pattern: pattern.clone(),
                handler: Arc::clone(&handler),
            });
        }
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatch `request` to the first matching route and return its response.
    ///
    /// Routes are tested in registration order. If no route matches, a `404 Not Found`
    /// response is returned.
    pub async fn route(&self, request: Request) -> Response {
        let found = self
            .routes
            .iter()
            .find(|route| route.matches(request.method(), request.path()));

        match found {
            Some(route) => (route.handler)(request).await,
            None => Response::new(StatusCode::NotFound),
        }
    }
}
