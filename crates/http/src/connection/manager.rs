//! Per-response connection management: the keep-alive header policy and the
//! decision on what happens to the connection after a response is written.

use std::time::Duration;

use http::{HeaderValue, header};

use crate::protocol::HttpResponse;
use crate::protocol::attributes::{OriginRequest, UpgradeHandle, UpgradeFn};

/// Keep-alive configuration: idle timeout between requests and the maximum
/// number of requests served on one connection.
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    timeout: Duration,
    max: u32,
}

impl KeepAlive {
    /// Floors: at least one second of timeout, at least one request.
    pub fn new(timeout: Duration, max: u32) -> Self {
        Self { timeout: timeout.max(Duration::from_secs(1)), max: max.max(1) }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

/// The fate of a connection after a response has been written.
pub enum ConnectionDecision {
    /// Shut the transport down.
    Close,
    /// Keep the connection and wait for the next request.
    Persist,
    /// Hand the raw stream to the registered upgrade callback.
    Upgrade(UpgradeFn),
}

impl std::fmt::Debug for ConnectionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionDecision::Close => f.write_str("Close"),
            ConnectionDecision::Persist => f.write_str("Persist"),
            ConnectionDecision::Upgrade(_) => f.write_str("Upgrade(..)"),
        }
    }
}

/// Applies the keep-alive policy to a response.
///
/// Pass-through unless keep-alive is configured, the request asked for it,
/// and the connection has requests left; a `Connection` header already set
/// by the application (an upgrade response, a forced close) is respected.
pub(crate) fn apply_keep_alive(
    config: Option<&KeepAlive>,
    origin: &OriginRequest,
    request_count: u32,
    response: &mut HttpResponse,
) {
    let Some(keep_alive) = config else { return };

    if response.headers().contains_key(header::CONNECTION) {
        return;
    }

    let requested = has_token(origin.headers().get(header::CONNECTION), "keep-alive");
    if !requested || request_count >= keep_alive.max {
        return;
    }

    response.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    let value = format!("timeout={}, max={}", keep_alive.timeout.as_secs(), keep_alive.max - request_count);
    response
        .headers_mut()
        .insert(header::HeaderName::from_static("keep-alive"), HeaderValue::try_from(value).expect("ascii header"));
}

/// Decides the connection's fate from the final response.
pub(crate) fn evaluate(response: &HttpResponse) -> ConnectionDecision {
    let connection = response.headers().get(header::CONNECTION);

    if has_token(connection, "upgrade")
        && let Some(handle) = response.extensions().get::<UpgradeHandle>()
        && let Some(handoff) = handle.take()
    {
        return ConnectionDecision::Upgrade(handoff);
    }

    if has_token(connection, "close") {
        ConnectionDecision::Close
    } else if has_token(connection, "keep-alive") {
        ConnectionDecision::Persist
    } else {
        ConnectionDecision::Close
    }
}

fn has_token(value: Option<&HeaderValue>, token: &str) -> bool {
    let Some(value) = value else { return false };
    let Ok(text) = value.to_str() else { return false };
    text.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}
