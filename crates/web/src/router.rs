//! The router: a mutable builder of pipeline elements under a mount path.
//!
//! A router accumulates request handlers, response filters, error handlers
//! and lifecycle hooks in registration order. Handlers execute in that
//! order with fallthrough — the first one that responds wins; there is no
//! most-specific reordering. Nested routers mount under
//! `parent mount + path` and collapse into a single aggregate handler
//! (their hooks bubble up to the parent), so the top-level router at `/`
//! yields one [`RouterApp`] the server drives.
//!
//! ```no_run
//! use tern_web::{Router, handler_fn, respond};
//!
//! let mut router = Router::new();
//! router
//!     .get("/hello/:name", handler_fn(|req| async move {
//!         let name = tern_web::path_param(&req, "name").unwrap_or("world").to_owned();
//!         respond(format!("hello {name}"))
//!     }))
//!     .route("/api", |api| {
//!         api.get("/messages/:id", handler_fn(|req| async move {
//!             let id = tern_web::path_param(&req, "id").unwrap_or("").to_owned();
//!             respond(id)
//!         }));
//!     });
//! let app = router.into_app();
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use tracing::debug;

use tern_http::app::Application;
use tern_http::lifecycle::LifecycleHook;
use tern_http::protocol::attributes::{Correlate, OriginRequest, PathParams, PeerAddr, RequestCount, ServerHandle};
use tern_http::protocol::{BoxError, Flow, HttpRequest, HttpResponse};

use crate::compose::{Coalesce, FilterChain, RecoverChain};
use crate::fileserver::FileServer;
use crate::handler::{ErrorHandler, RequestHandler, RequestPredicate, ResponseFilter};
use crate::pattern::{TargetPath, join_paths, normalize_path, within_mount};
use crate::websocket::{WebSocketApplication, WebSocketHandler};

/// Mutable builder for a routing pipeline.
pub struct Router {
    mount: String,
    handlers: Vec<Arc<dyn RequestHandler>>,
    filters: Vec<Arc<dyn ResponseFilter>>,
    recoverers: Vec<Arc<dyn ErrorHandler>>,
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl Router {
    /// The top-level router, mounted at `/`.
    pub fn new() -> Self {
        Self::mounted_at("/")
    }

    fn mounted_at(mount: &str) -> Self {
        let mount = normalize_path(mount).unwrap_or_else(|| panic!("invalid mount path: {mount}"));
        Self { mount, handlers: Vec::new(), filters: Vec::new(), recoverers: Vec::new(), hooks: Vec::new() }
    }

    /// The path this router is mounted under.
    pub fn mount_path(&self) -> &str {
        &self.mount
    }

    /// Appends a lifecycle hook.
    pub fn trigger<H: LifecycleHook + 'static>(&mut self, hook: H) -> &mut Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Appends a request handler. A handler that doubles as a lifecycle
    /// hook is registered as one too.
    pub fn incoming<H: RequestHandler + 'static>(&mut self, handler: H) -> &mut Self {
        let handler: Arc<dyn RequestHandler> = Arc::new(handler);
        if let Some(hook) = handler.lifecycle_hook() {
            self.hooks.push(hook);
        }
        self.handlers.push(handler);
        self
    }

    /// Appends a request handler guarded by a path pattern and, when
    /// `methods` is non-empty, by method. Path parameters bind as a request
    /// attribute on match.
    ///
    /// # Panics
    ///
    /// Panics if the pattern is invalid under this router's mount path
    /// (illegal registrations are programming errors).
    pub fn incoming_at<H: RequestHandler + 'static>(&mut self, path: &str, methods: &[Method], handler: H) -> &mut Self {
        let pattern = TargetPath::compile(&self.mount, path)
            .unwrap_or_else(|e| panic!("invalid route pattern {path:?}: {e}"));
        self.incoming(TargetedHandler { pattern, methods: methods.to_vec(), inner: Arc::new(handler) })
    }

    /// Mounts a nested router under `mount path + path`, configured by the
    /// given closure. The nested pipeline collapses into one handler; its
    /// lifecycle hooks bubble up.
    pub fn route(&mut self, path: &str, configure: impl FnOnce(&mut Router)) -> &mut Self {
        self.mount_nested(path, None, configure)
    }

    /// Like [`route`](Router::route), wrapped so requests failing the
    /// predicate pass through unchanged.
    pub fn route_when<P>(&mut self, path: &str, predicate: P, configure: impl FnOnce(&mut Router)) -> &mut Self
    where
        P: RequestPredicate + 'static,
    {
        self.mount_nested(path, Some(Arc::new(predicate)), configure)
    }

    fn mount_nested(
        &mut self,
        path: &str,
        predicate: Option<Arc<dyn RequestPredicate>>,
        configure: impl FnOnce(&mut Router),
    ) -> &mut Self {
        let mount = normalize_path(&join_paths(&self.mount, path))
            .unwrap_or_else(|| panic!("invalid mount path: {path}"));

        let mut nested = Router::mounted_at(&mount);
        configure(&mut nested);

        self.hooks.append(&mut nested.hooks);
        let aggregate = nested.into_aggregate();
        self.handlers.push(Arc::new(MountedHandler { mount, predicate, inner: aggregate }));
        self
    }

    /// Registers a WebSocket application on GET `path`. A valid upgrade
    /// request is answered `101 Switching Protocols` with the handoff
    /// registered; the engine passes the raw socket to `app` after the
    /// response is written.
    pub fn websocket<W: WebSocketApplication>(&mut self, path: &str, app: W) -> &mut Self {
        self.incoming_at(path, &[Method::GET], WebSocketHandler::new(app))
    }

    /// Serves static files under `mount path + path` from `dir`; for
    /// directories, redirects to the first existing file of `defaults`.
    pub fn fileserver(&mut self, path: &str, dir: impl Into<std::path::PathBuf>, defaults: &[&str]) -> &mut Self {
        let mount = normalize_path(&join_paths(&self.mount, path))
            .unwrap_or_else(|| panic!("invalid fileserver mount: {path}"));
        self.incoming(FileServer::new(mount, dir.into(), defaults))
    }

    /// Appends a response filter.
    pub fn outgoing<F: ResponseFilter + 'static>(&mut self, filter: F) -> &mut Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Appends an error handler.
    pub fn recover<E: ErrorHandler + 'static>(&mut self, handler: E) -> &mut Self {
        self.recoverers.push(Arc::new(handler));
        self
    }

    /// Clears all registered elements.
    pub fn reset(&mut self) -> &mut Self {
        self.handlers.clear();
        self.filters.clear();
        self.recoverers.clear();
        self.hooks.clear();
        self
    }

    /// Collapses this router into the application served by the engine.
    pub fn into_app(self) -> RouterApp {
        RouterApp {
            handler: Coalesce::new(self.handlers),
            filters: FilterChain::new(self.filters),
            recoverers: RecoverChain::new(self.recoverers),
            hooks: self.hooks,
        }
    }

    /// Collapses this router into a single request handler running the full
    /// pipeline (used for nested mounts).
    fn into_aggregate(self) -> Arc<dyn RequestHandler> {
        Arc::new(AggregateHandler {
            handler: Coalesce::new(self.handlers),
            filters: FilterChain::new(self.filters),
            recoverers: RecoverChain::new(self.recoverers),
        })
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience: the value of a bound path parameter.
pub fn path_param<'req>(req: &'req HttpRequest, name: &str) -> Option<&'req str> {
    req.extensions().get::<PathParams>().and_then(|params| params.get(name))
}

macro_rules! method_route {
    ($name:ident, $method:ident) => {
        #[doc = concat!("Registers a handler for ", stringify!($method), " requests on `path`.")]
        pub fn $name<H: RequestHandler + 'static>(&mut self, path: &str, handler: H) -> &mut Self {
            self.incoming_at(path, &[Method::$method], handler)
        }
    };
}

impl Router {
    method_route!(get, GET);
    method_route!(post, POST);
    method_route!(put, PUT);
    method_route!(delete, DELETE);
}

/// A handler guarded by a path pattern and an optional method set.
struct TargetedHandler {
    pattern: TargetPath,
    methods: Vec<Method>,
    inner: Arc<dyn RequestHandler>,
}

#[async_trait]
impl RequestHandler for TargetedHandler {
    async fn handle(&self, mut req: HttpRequest) -> Result<Flow, BoxError> {
        if !self.methods.is_empty() && !self.methods.contains(req.method()) {
            return Ok(Flow::Forward(req));
        }

        let Some(path) = normalize_path(req.uri().path()) else {
            return Ok(Flow::Forward(req));
        };

        match self.pattern.matches(&path) {
            Some(params) => {
                req.extensions_mut().insert(PathParams::new(params));
                self.inner.handle(req).await
            }
            None => Ok(Flow::Forward(req)),
        }
    }
}

/// A nested router's pipeline, mounted under a prefix and optionally
/// guarded by a predicate.
struct MountedHandler {
    mount: String,
    predicate: Option<Arc<dyn RequestPredicate>>,
    inner: Arc<dyn RequestHandler>,
}

#[async_trait]
impl RequestHandler for MountedHandler {
    async fn handle(&self, req: HttpRequest) -> Result<Flow, BoxError> {
        let inside = normalize_path(req.uri().path()).is_some_and(|path| within_mount(&self.mount, &path));
        if !inside {
            return Ok(Flow::Forward(req));
        }
        if let Some(predicate) = &self.predicate
            && !predicate.accepts(&req)
        {
            return Ok(Flow::Forward(req));
        }
        self.inner.handle(req).await
    }
}

/// A full pipeline collapsed into one request handler: coalesced handlers,
/// the error chain, then filters with attributes propagated from the
/// originating request.
struct AggregateHandler {
    handler: Coalesce,
    filters: FilterChain,
    recoverers: RecoverChain,
}

#[async_trait]
impl RequestHandler for AggregateHandler {
    async fn handle(&self, req: HttpRequest) -> Result<Flow, BoxError> {
        let origin = OriginRequest::snapshot(&req);
        let server = req.extensions().get::<ServerHandle>().cloned();
        let peer = req.extensions().get::<PeerAddr>().copied();
        let count = req.extensions().get::<RequestCount>().copied();
        let correlate = req.extensions().get::<Correlate>().cloned();

        let flow = match self.handler.handle(req).await {
            Ok(flow) => flow,
            Err(e) => match self.recoverers.recover(&origin, &e) {
                Some(response) => Flow::Respond(response),
                None => return Err(e),
            },
        };

        match flow {
            Flow::Forward(req) => Ok(Flow::Forward(req)),
            Flow::Respond(mut response) => {
                response.extensions_mut().insert(origin);
                if let Some(server) = server {
                    response.extensions_mut().insert(server);
                }
                if let Some(peer) = peer {
                    response.extensions_mut().insert(peer);
                }
                if let Some(count) = count {
                    response.extensions_mut().insert(count);
                }
                if let Some(correlate) = correlate {
                    response.extensions_mut().insert(correlate);
                }
                self.filters.filter(response).await.map(Flow::Respond)
            }
        }
    }
}

/// The application a top-level router collapses into.
pub struct RouterApp {
    handler: Coalesce,
    filters: FilterChain,
    recoverers: RecoverChain,
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl Application for RouterApp {
    async fn handle(&self, req: HttpRequest) -> Result<Flow, BoxError> {
        debug!(target = %req.uri(), method = %req.method(), "routing request");
        self.handler.handle(req).await
    }

    async fn filter(&self, res: HttpResponse) -> Result<HttpResponse, BoxError> {
        self.filters.filter(res).await
    }

    fn recover(&self, origin: &OriginRequest, err: &BoxError) -> Option<HttpResponse> {
        self.recoverers.recover(origin, err)
    }

    fn hooks(&self) -> Vec<Arc<dyn LifecycleHook>> {
        self.hooks.clone()
    }
}
