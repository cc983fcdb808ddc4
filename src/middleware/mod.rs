//! Middleware pipeline: composable before/after request handler logic.
//!
//! Each middleware wraps the next layer, enabling request inspection, short-circuit
//! responses, and response decoration without coupling handlers to infrastructure
//! concerns. A [`Pipeline`] terminates the chain with a [`Router`].
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining middleware chain.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`Pipeline`]: ordered middleware stack in front of a router.
//! - [`LoggerMiddleware`]: request/response logger.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Request, Response, StatusCode, router::Router};

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed on each call to [`run`](Self::run), so it cannot be called
/// more than once per middleware invocation.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<
    dyn Fn(Request, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |request: Request, next: Next| middleware.handle(request, next))
}

impl Next {
    fn new(middlewares: Arc<[MiddlewareHandler]>) -> Self {
        Self {
            middlewares,
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// If the chain is exhausted without producing a response, a
    /// `500 Internal Server Error` response is returned as a safe fallback.
    pub async fn run(mut self, request: Request) -> Response {
        match self.middlewares.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(request, self).await
            }
            None => Response::new(StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline"),
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive the [`Request`] and a [`Next`] cursor. They may pass the
/// request through, short-circuit with their own [`Response`], or decorate the
/// downstream response.
///
/// Implementations must be `Send + Sync` because middleware is shared across
/// Tokio tasks.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, request: Request, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// An ordered middleware stack whose last layer dispatches into a [`Router`].
///
/// # Examples
///
/// ```rust,no_run
/// use swapgate::middleware::{LoggerMiddleware, Pipeline};
/// use swapgate::{Request, Response, Router, StatusCode};
///
/// let mut router = Router::new();
/// router.get("/health", |_req: Request| async { Response::new(StatusCode::Ok) });
///
/// let pipeline = Pipeline::new(router).layer(LoggerMiddleware);
/// ```
pub struct Pipeline {
    layers: Vec<MiddlewareHandler>,
    router: Arc<Router>,
}

impl Pipeline {
    /// Creates a pipeline with no middleware in front of `router`.
    pub fn new(router: Router) -> Self {
        Self {
            layers: Vec::new(),
            router: Arc::new(router),
        }
    }

    /// Appends a middleware. Layers run in the order they are added.
    #[must_use]
    pub fn layer<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.layers.push(from_middleware(Arc::new(middleware)));
        self
    }

    /// Freezes the stack into a handler suitable for [`Server::run`](crate::Server::run).
    pub fn into_handler(
        self,
    ) -> impl Fn(Request) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static
    {
        let router = self.router;
        let terminal: MiddlewareHandler = Arc::new(
            move |request: Request, _next: Next| -> Pin<Box<dyn Future<Output = Response> + Send>> {
                let router = Arc::clone(&router);
                Box::pin(async move { router.route(request).await })
            },
        );

        let mut layers = self.layers;
        layers.push(terminal);
        let chain: Arc<[MiddlewareHandler]> = layers.into();

        move |request: Request| -> Pin<Box<dyn Future<Output = Response> + Send>> {
            let next = Next::new(Arc::clone(&chain));
            Box::pin(next.run(request))
        }
    }
}

/// Middleware that logs each request's method, path, status, and duration.
///
/// Server errors are logged at `warn`, everything else at `info`.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, request: Request, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let start = Instant::now();
            let method = request.method().to_string();
            let path = request.path().to_string();

            let response = next.run(request).await;

            let elapsed = start.elapsed();
            let status = response.status().as_u16();

            if status >= 500 {
                tracing::warn!(%method, %path, status, ?elapsed, "request failed");
            } else {
                tracing::info!(%method, %path, status, ?elapsed, "request served");
            }

            response
        })
    }
}
