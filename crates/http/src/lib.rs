//! An embeddable async HTTP/1.1 connection service engine.
//!
//! The crate owns everything between the TCP socket and the application
//! seam: accepting connections (optionally through a pluggable socket
//! factory for TLS), parsing requests, scheduling each request across the
//! server's named executor pools, writing responses with correct framing
//! (content-length, chunked, gzip/deflate codings), managing keep-alive
//! lifecycles, and handing sockets off to protocol-upgrade applications.
//!
//! Routing, path patterns and the handler composition algebra live in the
//! companion `tern-web` crate, which plugs in through the
//! [`Application`](app::Application) trait.

pub mod app;
pub mod codec;
pub mod connection;
pub mod executor;
pub mod lifecycle;
pub mod protocol;
pub mod server;

pub(crate) use help::ensure;

mod help {

    macro_rules! ensure {
        ($predicate:expr, $error:expr) => {
            if !$predicate {
                return Err($error);
            }
        };
    }
    pub(crate) use ensure;
}
