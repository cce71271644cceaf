//! WebSocket upgrade detection and handoff.
//!
//! The route handler only speaks HTTP: it validates the upgrade request,
//! answers `101 Switching Protocols` with the derived accept key, and
//! registers the handoff. The frame protocol is entirely the
//! [`WebSocketApplication`]'s business — it receives the raw byte stream
//! once the engine has written the response.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::{HeaderValue, Response, StatusCode, header};
use sha1::{Digest, Sha1};
use tracing::debug;

use tern_http::protocol::attributes::UpgradeHandle;
use tern_http::protocol::{BoxError, Entity, Flow, HttpRequest};
use tern_http::server::socket::ServerStream;

use crate::handler::RequestHandler;

/// RFC 6455 §1.3 key-derivation GUID.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// An application taking over a connection after a WebSocket upgrade.
#[async_trait]
pub trait WebSocketApplication: Send + Sync + 'static {
    async fn run(self: Arc<Self>, socket: ServerStream);
}

/// The GET handler registered by [`Router::websocket`](crate::Router::websocket).
pub(crate) struct WebSocketHandler<W> {
    app: Arc<W>,
}

impl<W: WebSocketApplication> WebSocketHandler<W> {
    pub(crate) fn new(app: W) -> Self {
        Self { app: Arc::new(app) }
    }
}

#[async_trait]
impl<W: WebSocketApplication> RequestHandler for WebSocketHandler<W> {
    async fn handle(&self, req: HttpRequest) -> Result<Flow, BoxError> {
        // a plain GET on the websocket path is not ours to answer
        if !req.headers().contains_key(header::UPGRADE) {
            return Ok(Flow::Forward(req));
        }

        let key = match validate_upgrade(&req) {
            Ok(key) => key,
            Err(reason) => {
                debug!(reason, "rejecting invalid websocket upgrade");
                let response = Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(Entity::from(reason))
                    .expect("static response builds");
                return Ok(Flow::Respond(response));
            }
        };

        let app = Arc::clone(&self.app);
        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::UPGRADE, HeaderValue::from_static("websocket"))
            .header(header::CONNECTION, HeaderValue::from_static("Upgrade"))
            .header(header::SEC_WEBSOCKET_ACCEPT, accept_key(&key))
            .body(Entity::empty())
            .expect("static response builds");

        response
            .extensions_mut()
            .insert(UpgradeHandle::new(Box::new(move |socket| Box::pin(app.run(socket)))));

        Ok(Flow::Respond(response))
    }
}

fn validate_upgrade(req: &HttpRequest) -> Result<String, &'static str> {
    if !header_has_token(req, header::UPGRADE, "websocket") {
        return Err("unsupported upgrade protocol");
    }
    if !header_has_token(req, header::CONNECTION, "upgrade") {
        return Err("connection header must request an upgrade");
    }
    match req.headers().get(header::SEC_WEBSOCKET_VERSION).and_then(|v| v.to_str().ok()) {
        Some("13") => {}
        _ => return Err("unsupported websocket version"),
    }
    let key = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or("missing websocket key")?;
    Ok(key.to_owned())
}

fn header_has_token(req: &HttpRequest, name: header::HeaderName, token: &str) -> bool {
    req.headers()
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|text| text.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// `Sec-WebSocket-Accept` for a client key, per RFC 6455.
fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(sha1.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Request};

    struct NoopApp;

    #[async_trait]
    impl WebSocketApplication for NoopApp {
        async fn run(self: Arc<Self>, _socket: ServerStream) {}
    }

    fn upgrade_request() -> http::request::Builder {
        Request::builder()
            .method(Method::GET)
            .uri("/chat/room")
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
    }

    #[test]
    fn rfc_accept_key_vector() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[tokio::test]
    async fn valid_upgrade_gets_101_with_handoff() {
        let handler = WebSocketHandler::new(NoopApp);
        let req = upgrade_request().body(Entity::empty()).unwrap();

        let flow = handler.handle(req).await.unwrap();
        let response = flow.into_response().unwrap();

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers().get(header::UPGRADE).unwrap(), "websocket");
        assert_eq!(response.headers().get(header::CONNECTION).unwrap(), "Upgrade");
        assert_eq!(
            response.headers().get(header::SEC_WEBSOCKET_ACCEPT).unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
        assert!(response.extensions().get::<UpgradeHandle>().is_some());
    }

    #[tokio::test]
    async fn plain_get_falls_through() {
        let handler = WebSocketHandler::new(NoopApp);
        let req = Request::builder().method(Method::GET).uri("/chat/room").body(Entity::empty()).unwrap();

        assert!(matches!(handler.handle(req).await.unwrap(), Flow::Forward(_)));
    }

    #[tokio::test]
    async fn wrong_version_is_rejected() {
        let handler = WebSocketHandler::new(NoopApp);
        let req = Request::builder()
            .method(Method::GET)
            .uri("/chat/room")
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_VERSION, "8")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Entity::empty())
            .unwrap();

        let flow = handler.handle(req).await.unwrap();
        assert_eq!(flow.into_response().unwrap().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_key_is_rejected() {
        let handler = WebSocketHandler::new(NoopApp);
        let req = Request::builder()
            .method(Method::GET)
            .uri("/chat/room")
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .body(Entity::empty())
            .unwrap();

        let flow = handler.handle(req).await.unwrap();
        assert_eq!(flow.into_response().unwrap().status(), StatusCode::BAD_REQUEST);
    }
}
