//! The server: configuration, startup/shutdown lifecycle, and the accept
//! loop that feeds the per-connection service engine.
//!
//! ```no_run
//! use tern_http::app::app_fn;
//! use tern_http::protocol::{Entity, Flow};
//! use tern_http::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = app_fn(|_req| async {
//!         Ok(Flow::Respond(http::Response::new(Entity::from("hello"))))
//!     });
//!
//!     let server = Server::builder().bind("127.0.0.1:3000").build(app).unwrap();
//!     server.start().await.unwrap();
//!     server.closed().await;
//! }
//! ```

pub mod socket;

mod date;
mod engine;

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app::Application;
use crate::connection::manager::KeepAlive;
use crate::executor::ExecutorSet;
use crate::lifecycle::{self, LifecycleHook};
use crate::protocol::BoxError;
use crate::protocol::attributes::ServerHandle;
use self::socket::{PlainSocketFactory, SocketFactory};

pub(crate) use self::date::DateService;

/// Process-wide counter handing out server ids (the `serviceCounter` part of
/// every correlate tag).
static SERVER_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Configuration the engine consults per connection.
#[derive(Debug, Clone)]
pub(crate) struct EngineConfig {
    pub(crate) buffer_size: usize,
    pub(crate) header_limit: usize,
    pub(crate) read_timeout: Duration,
    pub(crate) keep_alive: Option<KeepAlive>,
}

/// Builder for a [`Server`]. All options have defaults; floors keep the
/// configuration serviceable.
pub struct ServerBuilder {
    address: Option<Vec<SocketAddr>>,
    backlog: u32,
    pool_size: usize,
    queue_size: Option<usize>,
    buffer_size: usize,
    read_timeout: Duration,
    header_limit: usize,
    keep_alive: Option<KeepAlive>,
    factory: Arc<dyn SocketFactory>,
}

impl ServerBuilder {
    fn new() -> Self {
        let pool_size = std::thread::available_parallelism().map(usize::from).unwrap_or(1);
        Self {
            address: None,
            backlog: 50,
            pool_size,
            queue_size: None,
            buffer_size: 8192,
            read_timeout: Duration::from_millis(5000),
            header_limit: 100,
            keep_alive: None,
            factory: Arc::new(PlainSocketFactory),
        }
    }

    pub fn bind<A: ToSocketAddrs>(mut self, address: A) -> Self {
        let resolved = address.to_socket_addrs().expect("bind address resolves").collect::<Vec<_>>();
        self.address = Some(resolved);
        self
    }

    /// TCP listen backlog, floor 1. Default 50.
    pub fn backlog_size(mut self, backlog: usize) -> Self {
        self.backlog = backlog.max(1) as u32;
        self
    }

    /// Service pool size P, floor 1. Default: CPU count.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Service pool queue Q, floor 0. Default P×4.
    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = Some(queue_size);
        self
    }

    /// Read/write buffer and maximum header line, floor 1024. Default 8192.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1024);
        self
    }

    /// Socket read timeout, floor 100 ms. Default 5000 ms.
    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout.max(Duration::from_millis(100));
        self
    }

    /// Maximum header count, floor 10. Default 100.
    pub fn header_limit(mut self, header_limit: usize) -> Self {
        self.header_limit = header_limit.max(10);
        self
    }

    /// Enables persistent connections with the given idle timeout and
    /// per-connection request limit. Off by default.
    pub fn keep_alive(mut self, timeout: Duration, max: u32) -> Self {
        self.keep_alive = Some(KeepAlive::new(timeout, max));
        self
    }

    /// Replaces the plain TCP socket factory (e.g. with a TLS one).
    pub fn socket_factory<F: SocketFactory + 'static>(mut self, factory: F) -> Self {
        self.factory = Arc::new(factory);
        self
    }

    pub fn build<A>(self, app: A) -> Result<Server<A>, ServerBuildError>
    where
        A: Application + Send + Sync + 'static,
    {
        let address = self.address.ok_or(ServerBuildError::MissingAddress)?;
        let id = SERVER_COUNTER.fetch_add(1, Ordering::Relaxed);
        let queue_size = self.queue_size.unwrap_or(self.pool_size * 4);
        let hooks = app.hooks();

        Ok(Server {
            inner: Arc::new(ServerInner {
                id,
                app,
                address,
                backlog: self.backlog,
                config: EngineConfig {
                    buffer_size: self.buffer_size,
                    header_limit: self.header_limit,
                    read_timeout: self.read_timeout,
                    keep_alive: self.keep_alive,
                },
                factory: self.factory,
                executors: ExecutorSet::new(id, self.pool_size, queue_size),
                hooks,
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                local_addr: std::sync::Mutex::new(None),
                connection_counter: AtomicU64::new(0),
            }),
        })
    }
}

/// Errors from [`ServerBuilder::build`].
#[derive(Error, Debug)]
pub enum ServerBuildError {
    #[error("bind address must be set")]
    MissingAddress,
}

/// The HTTP server: accept loop, executor pools and lifecycle.
pub struct Server<A> {
    inner: Arc<ServerInner<A>>,
}

pub(crate) struct ServerInner<A> {
    pub(crate) id: usize,
    pub(crate) app: A,
    address: Vec<SocketAddr>,
    backlog: u32,
    pub(crate) config: EngineConfig,
    pub(crate) factory: Arc<dyn SocketFactory>,
    pub(crate) executors: ExecutorSet,
    pub(crate) hooks: Vec<Arc<dyn LifecycleHook>>,
    pub(crate) shutdown: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
    pub(crate) connection_counter: AtomicU64,
}

impl Server<()> {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }
}

impl<A> Server<A>
where
    A: Application + Send + Sync + 'static,
{
    /// Binds the listener, runs start hooks, and spawns the accept loop.
    /// Returns the bound address.
    ///
    /// A failing hook marked critical aborts startup: hooks already started
    /// are stopped in reverse and the error is returned.
    pub async fn start(&self) -> Result<SocketAddr, BoxError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err("server already started".into());
        }

        let listener = bind_listener(&inner.address, inner.backlog)?;
        let local_addr = listener.local_addr()?;
        *inner.local_addr.lock().expect("local addr lock") = Some(local_addr);

        let handle = ServerHandle::new(inner.id, local_addr, inner.shutdown.clone());

        if let Err(cause) = lifecycle::run_start_hooks(&inner.hooks, &handle) {
            inner.closed.store(true, Ordering::SeqCst);
            return Err(cause);
        }

        info!(server = inner.id, %local_addr, "server started");

        let accept_inner = Arc::clone(inner);
        inner.executors.spawn_unpooled(engine::accept_loop(accept_inner, listener, handle));

        Ok(local_addr)
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().expect("local addr lock")
    }

    /// Shuts the server down: stops accepting, closes the pools in fixed
    /// order, and runs stop hooks in reverse registration order. Idempotent.
    pub fn close(&self) {
        let addr = self.local_addr().unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let handle = ServerHandle::new(self.inner.id, addr, self.inner.shutdown.clone());
        self.inner.shutdown.cancel();
        self.inner.complete_close(&handle);
    }

    /// Resolves when the server has been closed and all its tracked tasks
    /// have finished.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
        self.inner.executors.wait_idle().await;
    }
}

impl<A> ServerInner<A> {
    pub(crate) fn complete_close(&self, handle: &ServerHandle) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.executors.shutdown();
        lifecycle::run_stop_hooks(&self.hooks, handle);
        info!(server = self.id, "server closed");
    }
}

fn bind_listener(address: &[SocketAddr], backlog: u32) -> Result<TcpListener, BoxError> {
    let mut last_error: Option<std::io::Error> = None;
    for addr in address {
        let socket = match if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() } {
            Ok(socket) => socket,
            Err(e) => {
                last_error = Some(e);
                continue;
            }
        };
        if let Err(e) = socket.set_reuseaddr(true) {
            last_error = Some(e);
            continue;
        }
        if let Err(e) = socket.bind(*addr) {
            error!(%addr, cause = %e, "bind failed");
            last_error = Some(e);
            continue;
        }
        match socket.listen(backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.map(Into::into).unwrap_or_else(|| "no bind address available".into()))
}
