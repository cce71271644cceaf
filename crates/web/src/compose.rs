//! Composition of pipeline elements.
//!
//! Handlers coalesce: each may respond or forward, and the first response
//! wins. Filters chain left to right. Error handlers coalesce on the first
//! `Some`. These combinators are themselves pipeline elements, so composed
//! chains nest.

use std::sync::Arc;

use async_trait::async_trait;

use tern_http::protocol::attributes::OriginRequest;
use tern_http::protocol::{BoxError, Flow, HttpRequest, HttpResponse};

use crate::handler::{ErrorHandler, RequestHandler, ResponseFilter};

/// Request handlers applied left to right; the first that responds wins,
/// forwarding feeds the (possibly transformed) request to the next.
pub struct Coalesce {
    handlers: Vec<Arc<dyn RequestHandler>>,
}

impl Coalesce {
    pub fn new(handlers: Vec<Arc<dyn RequestHandler>>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl RequestHandler for Coalesce {
    async fn handle(&self, req: HttpRequest) -> Result<Flow, BoxError> {
        let mut req = req;
        for handler in &self.handlers {
            match handler.handle(req).await? {
                Flow::Forward(forwarded) => req = forwarded,
                Flow::Respond(response) => return Ok(Flow::Respond(response)),
            }
        }
        Ok(Flow::Forward(req))
    }
}

/// Response filters applied left to right.
pub struct FilterChain {
    filters: Vec<Arc<dyn ResponseFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn ResponseFilter>>) -> Self {
        Self { filters }
    }
}

#[async_trait]
impl ResponseFilter for FilterChain {
    async fn filter(&self, res: HttpResponse) -> Result<HttpResponse, BoxError> {
        let mut res = res;
        for filter in &self.filters {
            res = filter.filter(res).await?;
        }
        Ok(res)
    }
}

/// Error handlers tried left to right; the first defined result wins.
pub struct RecoverChain {
    handlers: Vec<Arc<dyn ErrorHandler>>,
}

impl RecoverChain {
    pub fn new(handlers: Vec<Arc<dyn ErrorHandler>>) -> Self {
        Self { handlers }
    }
}

impl ErrorHandler for RecoverChain {
    fn recover(&self, origin: &OriginRequest, err: &BoxError) -> Option<HttpResponse> {
        self.handlers.iter().find_map(|handler| handler.recover(origin, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, filter_fn, recover_fn};
    use http::{Request, Response, StatusCode};
    use tern_http::protocol::Entity;

    fn request(path: &str) -> HttpRequest {
        Request::builder().uri(path.to_owned()).body(Entity::empty()).unwrap()
    }

    fn respond_with(status: StatusCode) -> impl Fn(HttpRequest) -> Result<Flow, BoxError> {
        move |_req| Ok(Flow::Respond(Response::builder().status(status).body(Entity::empty()).unwrap()))
    }

    #[tokio::test]
    async fn coalesce_stops_at_the_first_response() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let hits_in_third = Arc::clone(&hits);

        let teapot = respond_with(StatusCode::IM_A_TEAPOT);
        let coalesce = Coalesce::new(vec![
            Arc::new(handler_fn(|req| async move { Ok(Flow::Forward(req)) })),
            Arc::new(handler_fn(move |req| {
                let result = teapot(req);
                async move { result }
            })),
            Arc::new(handler_fn(move |req| {
                hits_in_third.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move { Ok(Flow::Forward(req)) }
            })),
        ]);

        let flow = coalesce.handle(request("/")).await.unwrap();
        let response = flow.into_response().expect("second handler responded");
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn coalesce_forwards_the_transformed_request() {
        let coalesce = Coalesce::new(vec![
            Arc::new(handler_fn(|req: HttpRequest| async move {
                let (mut parts, body) = req.into_parts();
                parts.uri = "/rewritten".parse().unwrap();
                Ok(Flow::Forward(Request::from_parts(parts, body)))
            })),
            Arc::new(handler_fn(|req: HttpRequest| async move {
                let body = Entity::from(req.uri().path().to_owned());
                Ok(Flow::Respond(Response::new(body)))
            })),
        ]);

        let flow = coalesce.handle(request("/original")).await.unwrap();
        let response = flow.into_response().unwrap();
        assert_eq!(response.body().size(), Some("/rewritten".len() as u64));
    }

    #[tokio::test]
    async fn coalesce_forwards_when_no_handler_responds() {
        let coalesce = Coalesce::new(vec![Arc::new(handler_fn(|req| async move { Ok(Flow::Forward(req)) }))]);
        assert!(matches!(coalesce.handle(request("/")).await.unwrap(), Flow::Forward(_)));
    }

    #[tokio::test]
    async fn filters_chain_left_to_right() {
        let chain = FilterChain::new(vec![
            Arc::new(filter_fn(|mut res: HttpResponse| async move {
                res.headers_mut().insert("x-order", "first".parse().unwrap());
                Ok(res)
            })),
            Arc::new(filter_fn(|mut res: HttpResponse| async move {
                res.headers_mut().insert("x-order", "second".parse().unwrap());
                Ok(res)
            })),
        ]);

        let res = chain.filter(Response::new(Entity::empty())).await.unwrap();
        assert_eq!(res.headers().get("x-order").unwrap(), "second");
    }

    #[test]
    fn recover_chain_takes_the_first_defined_result() {
        let chain = RecoverChain::new(vec![
            Arc::new(recover_fn(|_origin, _err| None)),
            Arc::new(recover_fn(|_origin, _err| {
                Some(Response::builder().status(StatusCode::BAD_GATEWAY).body(Entity::empty()).unwrap())
            })),
            Arc::new(recover_fn(|_origin, _err| {
                Some(Response::builder().status(StatusCode::IM_A_TEAPOT).body(Entity::empty()).unwrap())
            })),
        ]);

        let origin = OriginRequest::snapshot(&Request::builder().body(()).unwrap());
        let err: BoxError = "boom".into();
        let res = chain.recover(&origin, &err).unwrap();
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn recover_chain_reraises_by_returning_none() {
        let chain = RecoverChain::new(vec![Arc::new(recover_fn(|_origin, _err| None))]);
        let origin = OriginRequest::snapshot(&Request::builder().body(()).unwrap());
        let err: BoxError = "boom".into();
        assert!(chain.recover(&origin, &err).is_none());
    }
}
