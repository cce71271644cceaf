//! A tour of the routing pipeline: path parameters, a mounted sub-router,
//! a response filter, an error handler, keep-alive and a static file mount.
//!
//! ```bash
//! cargo run --example getting_started
//! curl http://127.0.0.1:3000/greet/ada
//! curl http://127.0.0.1:3000/api/messages/42
//! curl -i http://127.0.0.1:3000/broken
//! ```

use std::time::Duration;

use http::StatusCode;
use tern_http::server::Server;
use tern_web::{
    BoxError, Flow, Router, filter_fn, handler_fn, path_param, recover_fn, respond, respond_with,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let mut router = Router::new();
    router
        .get("/greet/:name", handler_fn(|req| async move {
            let name = path_param(&req, "name").unwrap_or("stranger").to_owned();
            respond(format!("hello, {name}\n"))
        }))
        .get("/broken", handler_fn(|_req| async { Err::<Flow, BoxError>("something fell over".into()) }))
        .route("/api", |api| {
            api.get("/messages/:id", handler_fn(|req| async move {
                let id = path_param(&req, "id").unwrap_or("?").to_owned();
                respond(format!("message {id}\n"))
            }));
        })
        .fileserver("/static", "./public", &["index.html"])
        .outgoing(filter_fn(|mut res| async move {
            res.headers_mut().insert("x-powered-by", "tern".parse().unwrap());
            Ok(res)
        }))
        .recover(recover_fn(|origin, err| {
            tracing::warn!(target = %origin.uri(), cause = %err, "handler failed, answering 502");
            respond_with(StatusCode::BAD_GATEWAY, "upstream trouble\n").ok()?.into_response()
        }));

    let server = Server::builder()
        .bind("127.0.0.1:3000")
        .keep_alive(Duration::from_secs(5), 100)
        .build(router.into_app())
        .unwrap();

    server.start().await.unwrap();
    server.closed().await;
}
