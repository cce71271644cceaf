//! Routing pipeline for the tern HTTP server.
//!
//! A [`Router`] accumulates request handlers, response filters, error
//! handlers and lifecycle hooks under a mount path; nested routers, static
//! file serving and WebSocket upgrades compose into the same pipeline. The
//! collapsed [`RouterApp`] plugs into `tern-http`'s service engine.
//!
//! ```no_run
//! use tern_web::{Router, handler_fn, respond};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut router = Router::new();
//!     router.get("/about", handler_fn(|_req| async { respond("hi") }));
//!
//!     let server = tern_http::server::Server::builder()
//!         .bind("127.0.0.1:3000")
//!         .build(router.into_app())
//!         .unwrap();
//!     server.start().await.unwrap();
//!     server.closed().await;
//! }
//! ```

pub mod compose;
pub mod fileserver;
pub mod handler;
pub mod pattern;
pub mod router;
pub mod websocket;

pub use handler::{
    ErrorHandler, RequestHandler, RequestPredicate, ResponseFilter, filter_fn, handler_fn, predicate_fn,
    recover_fn,
};
pub use pattern::{PatternError, TargetPath, normalize_path};
pub use router::{Router, RouterApp, path_param};
pub use websocket::WebSocketApplication;

pub use tern_http::protocol::{BoxError, Entity, Flow, HttpRequest, HttpResponse};

use http::Response;

/// Shorthand for a handler's happy path: a `200 OK` response with the given
/// entity.
pub fn respond(body: impl Into<Entity>) -> Result<Flow, BoxError> {
    Ok(Flow::Respond(Response::new(body.into())))
}

/// Shorthand for answering with a specific status and entity.
pub fn respond_with(status: http::StatusCode, body: impl Into<Entity>) -> Result<Flow, BoxError> {
    Ok(Flow::Respond(Response::builder().status(status).body(body.into())?))
}
