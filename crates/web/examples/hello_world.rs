//! Minimal server: one route, default configuration.
//!
//! ```bash
//! cargo run --example hello_world
//! curl http://127.0.0.1:3000/
//! ```

use tern_http::server::Server;
use tern_web::{Router, handler_fn, respond};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let mut router = Router::new();
    router.get("/", handler_fn(|_req| async { respond("Hello, World!\n") }));

    let server = Server::builder().bind("127.0.0.1:3000").build(router.into_app()).unwrap();
    server.start().await.unwrap();
    server.closed().await;
}
