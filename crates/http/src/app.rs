//! The seam between the service engine and the application.
//!
//! The engine drives a single [`Application`]: request handling (which may
//! decline by forwarding), the response filter chain, and the error-handler
//! chain as a partial mapping. The routing layer assembles an application
//! from its registered pipeline elements; tests and small embedders can use
//! [`app_fn`] for a handler-only application.

use std::sync::Arc;

use crate::lifecycle::LifecycleHook;
use crate::protocol::attributes::OriginRequest;
use crate::protocol::{BoxError, Flow, HttpRequest, HttpResponse};

/// The application served by a [`Server`](crate::server::Server).
#[trait_variant::make(Application: Send)]
pub trait LocalApplication: Sync {
    /// Handles one request, responding or forwarding.
    async fn handle(&self, req: HttpRequest) -> Result<Flow, BoxError>;

    /// Transforms an outgoing response.
    async fn filter(&self, res: HttpResponse) -> Result<HttpResponse, BoxError>;

    /// Partial mapping from a handler error to a response. `None` means the
    /// error is unhandled and the engine answers with its default 500.
    fn recover(&self, origin: &OriginRequest, err: &BoxError) -> Option<HttpResponse>;

    /// Lifecycle hooks to run at server start/stop.
    fn hooks(&self) -> Vec<Arc<dyn LifecycleHook>>;
}

/// A handler-only application with pass-through filtering and no recovery.
pub struct AppFn<F> {
    f: F,
}

/// Builds an application from an async handler function.
pub fn app_fn<F, Fut>(f: F) -> AppFn<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Flow, BoxError>> + Send,
{
    AppFn { f }
}

impl<F, Fut> Application for AppFn<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Flow, BoxError>> + Send,
{
    async fn handle(&self, req: HttpRequest) -> Result<Flow, BoxError> {
        (self.f)(req).await
    }

    async fn filter(&self, res: HttpResponse) -> Result<HttpResponse, BoxError> {
        Ok(res)
    }

    fn recover(&self, _origin: &OriginRequest, _err: &BoxError) -> Option<HttpResponse> {
        None
    }

    fn hooks(&self) -> Vec<Arc<dyn LifecycleHook>> {
        Vec::new()
    }
}
