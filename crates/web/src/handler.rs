//! The three pipeline element kinds and the request predicate.
//!
//! A [`RequestHandler`] consumes a request and either responds or forwards
//! it ([`Flow`]); a [`ResponseFilter`] transforms outgoing responses; an
//! [`ErrorHandler`] is a partial mapping from a handler error to a response.
//! All three are single-method traits with `_fn` adapters so plain closures
//! can be registered.
//!
//! A handler that also participates in the server lifecycle exposes its
//! hook through [`RequestHandler::lifecycle_hook`]; the router registers it
//! automatically.

use std::sync::Arc;

use async_trait::async_trait;

use tern_http::lifecycle::LifecycleHook;
use tern_http::protocol::attributes::OriginRequest;
use tern_http::protocol::{BoxError, Flow, HttpRequest, HttpResponse};

/// Handles a request: respond, or forward to the next element.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, req: HttpRequest) -> Result<Flow, BoxError>;

    /// The lifecycle hook this handler doubles as, if any. Returning
    /// `Some` registers the hook when the handler is added to a router.
    fn lifecycle_hook(&self) -> Option<Arc<dyn LifecycleHook>> {
        None
    }
}

/// Transforms an outgoing response.
#[async_trait]
pub trait ResponseFilter: Send + Sync {
    async fn filter(&self, res: HttpResponse) -> Result<HttpResponse, BoxError>;
}

/// Partial mapping from an error to a response; `None` passes the error to
/// the next handler in the chain.
pub trait ErrorHandler: Send + Sync {
    fn recover(&self, origin: &OriginRequest, err: &BoxError) -> Option<HttpResponse>;
}

/// A predicate over requests, used for conditional mounting.
pub trait RequestPredicate: Send + Sync {
    fn accepts(&self, req: &HttpRequest) -> bool;
}

/// Wraps an async closure as a [`RequestHandler`].
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Flow, BoxError>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Flow, BoxError>> + Send,
{
    async fn handle(&self, req: HttpRequest) -> Result<Flow, BoxError> {
        (self.f)(req).await
    }
}

/// Wraps an async closure as a [`ResponseFilter`].
pub struct FilterFn<F> {
    f: F,
}

pub fn filter_fn<F, Fut>(f: F) -> FilterFn<F>
where
    F: Fn(HttpResponse) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HttpResponse, BoxError>> + Send,
{
    FilterFn { f }
}

#[async_trait]
impl<F, Fut> ResponseFilter for FilterFn<F>
where
    F: Fn(HttpResponse) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HttpResponse, BoxError>> + Send,
{
    async fn filter(&self, res: HttpResponse) -> Result<HttpResponse, BoxError> {
        (self.f)(res).await
    }
}

/// Wraps a closure as an [`ErrorHandler`].
pub struct RecoverFn<F> {
    f: F,
}

pub fn recover_fn<F>(f: F) -> RecoverFn<F>
where
    F: Fn(&OriginRequest, &BoxError) -> Option<HttpResponse> + Send + Sync,
{
    RecoverFn { f }
}

impl<F> ErrorHandler for RecoverFn<F>
where
    F: Fn(&OriginRequest, &BoxError) -> Option<HttpResponse> + Send + Sync,
{
    fn recover(&self, origin: &OriginRequest, err: &BoxError) -> Option<HttpResponse> {
        (self.f)(origin, err)
    }
}

/// Wraps a closure as a [`RequestPredicate`].
pub struct PredicateFn<F>(F);

pub fn predicate_fn<F>(f: F) -> PredicateFn<F>
where
    F: Fn(&HttpRequest) -> bool + Send + Sync,
{
    PredicateFn(f)
}

impl<F> RequestPredicate for PredicateFn<F>
where
    F: Fn(&HttpRequest) -> bool + Send + Sync,
{
    fn accepts(&self, req: &HttpRequest) -> bool {
        (self.0)(req)
    }
}
