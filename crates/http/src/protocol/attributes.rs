//! Typed attributes carried in message extensions.
//!
//! The engine decorates every parsed request with a small set of typed
//! values (`http::Extensions` keyed by type): the owning server handle, the
//! peer address, the 1-based request count on the connection, and the
//! correlate tag used to join log records. The routing layer adds
//! [`PathParams`]; responses additionally carry the [`OriginRequest`] they
//! answer and, for protocol upgrades, the registered [`UpgradeHandle`].

use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::server::socket::ServerStream;

/// Short tag unique per (service, connection, request), hex encoded.
///
/// Attached to every request/response pair and included in all engine log
/// records for that request.
#[derive(Debug, Clone)]
pub struct Correlate(Arc<str>);

impl Correlate {
    pub(crate) fn new(service_id: usize, connection_id: u64, request_index: u32) -> Self {
        Self(format!("{service_id:x}-{connection_id:x}-{request_index:x}").into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Correlate {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

/// 1-based index of the request on its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestCount(pub u32);

/// Address of the remote peer. Stands in for the raw socket, which stays
/// under exclusive ownership of the engine until an upgrade hands it off.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub SocketAddr);

/// Named captures from the matched route pattern.
#[derive(Debug, Clone, Default)]
pub struct PathParams(Arc<HashMap<String, String>>);

impl PathParams {
    pub fn new(params: HashMap<String, String>) -> Self {
        Self(Arc::new(params))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Snapshot of the request a response answers: the pre-handler head
/// (method, target, version, headers), not any transformed copy.
#[derive(Debug, Clone)]
pub struct OriginRequest(Arc<http::Request<()>>);

impl OriginRequest {
    pub fn snapshot<B>(req: &http::Request<B>) -> Self {
        let mut head = http::Request::builder()
            .method(req.method().clone())
            .uri(req.uri().clone())
            .version(req.version())
            .body(())
            .expect("rebuilding a parsed request head cannot fail");
        *head.headers_mut() = req.headers().clone();
        Self(Arc::new(head))
    }

    pub fn method(&self) -> &http::Method {
        self.0.method()
    }

    pub fn uri(&self) -> &http::Uri {
        self.0.uri()
    }

    pub fn version(&self) -> http::Version {
        self.0.version()
    }

    pub fn headers(&self) -> &http::HeaderMap {
        self.0.headers()
    }
}

/// Handle to the server owning the current connection.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    id: usize,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl ServerHandle {
    pub(crate) fn new(id: usize, local_addr: SocketAddr, shutdown: CancellationToken) -> Self {
        Self { id, local_addr, shutdown }
    }

    /// The server's id, unique within the process.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Requests shutdown of the owning server.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

/// Callback that takes ownership of the raw byte stream after an upgrade
/// response has been written.
pub type UpgradeFn = Box<dyn FnOnce(ServerStream) -> BoxFuture<'static, ()> + Send>;

/// A registered upgrade handoff, carried as a response attribute.
///
/// The handler that produced the `101` response registers the callback; the
/// engine takes it exactly once when the connection-management decision is
/// `Upgrade`.
#[derive(Clone)]
pub struct UpgradeHandle(Arc<Mutex<Option<UpgradeFn>>>);

impl UpgradeHandle {
    pub fn new(f: UpgradeFn) -> Self {
        Self(Arc::new(Mutex::new(Some(f))))
    }

    /// Takes the handoff callback; subsequent calls return `None`.
    pub fn take(&self) -> Option<UpgradeFn> {
        self.0.lock().expect("upgrade handle poisoned").take()
    }
}

impl std::fmt::Debug for UpgradeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str("UpgradeHandle")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlate_is_hex_of_all_three_parts() {
        let correlate = Correlate::new(31, 255, 2);
        assert_eq!(correlate.as_str(), "1f-ff-2");
    }

    #[test]
    fn origin_request_snapshots_the_head() {
        let req = http::Request::builder()
            .method(http::Method::POST)
            .uri("/messages/42?x=1")
            .header("host", "example")
            .body(())
            .unwrap();

        let origin = OriginRequest::snapshot(&req);
        assert_eq!(origin.method(), http::Method::POST);
        assert_eq!(origin.uri().path(), "/messages/42");
        assert_eq!(origin.headers().get("host").unwrap(), "example");
    }

    #[test]
    fn upgrade_handle_is_taken_once() {
        let handle = UpgradeHandle::new(Box::new(|_socket| Box::pin(async {})));
        assert!(handle.take().is_some());
        assert!(handle.take().is_none());
    }
}
