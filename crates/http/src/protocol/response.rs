//! The response head handed to the wire encoder.

use http::response::Parts;
use http::{HeaderMap, Response, StatusCode, Version};

/// An HTTP response head: status, version and headers, finalized by the
/// engine (Date, Connection, framing headers) before it reaches the codec.
#[derive(Debug)]
pub struct ResponseHead {
    inner: Response<()>,
}

impl ResponseHead {
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }
}

impl From<Parts> for ResponseHead {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Response::from_parts(parts, ()) }
    }
}

impl From<Response<()>> for ResponseHead {
    #[inline]
    fn from(inner: Response<()>) -> Self {
        Self { inner }
    }
}
