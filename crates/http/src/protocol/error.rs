//! Error types for the protocol layer.
//!
//! [`HttpError`] is the umbrella at the connection boundary; it wraps either
//! a [`ParseError`] (read side) or a [`SendError`] (write side), or carries
//! the distinguished response-abort signal. `ParseError` knows which wire
//! status each read failure maps to, so the engine can answer a malformed
//! request without consulting the application pipeline.

use http::StatusCode;
use std::io;
use thiserror::Error;

/// Boxed error type used at the application seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The top-level error type for connection processing.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Errors while reading and parsing a request.
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    /// Errors while encoding and sending a response.
    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    /// The distinguished "send nothing, close the connection" signal.
    #[error("response aborted")]
    Aborted,
}

impl HttpError {
    #[inline]
    pub fn is_abort(&self) -> bool {
        matches!(self, HttpError::Aborted)
    }
}

/// The response-abort signal as a standalone error value.
///
/// A handler that returns this (boxed) instructs the engine to terminate the
/// current iteration without writing anything.
#[derive(Debug, Error)]
#[error("response aborted")]
pub struct ResponseAborted;

/// Returns true when `err` is (or wraps) the response-abort signal.
pub fn is_abort(err: &BoxError) -> bool {
    if err.downcast_ref::<ResponseAborted>().is_some() {
        return true;
    }
    matches!(err.downcast_ref::<HttpError>(), Some(e) if e.is_abort())
}

/// Errors raised while parsing an HTTP request.
#[derive(Error, Debug)]
pub enum ParseError {
    /// A header line exceeded the buffer size, or the header block exceeded
    /// its byte budget.
    #[error("header too large, current: {current_size} exceeds the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    /// More headers than the configured limit.
    #[error("header count exceeds the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    /// Invalid header name, value or structure.
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    /// Unsupported or malformed HTTP version token.
    #[error("invalid http version: {reason}")]
    InvalidVersion { reason: String },

    /// Empty or malformed method token.
    #[error("invalid http method")]
    InvalidMethod,

    /// The request target did not fit the read buffer.
    #[error("request target too long: line of {current_size} bytes exceeds buffer of {max_size}")]
    UriTooLong { current_size: usize, max_size: usize },

    /// Syntactically invalid request target.
    #[error("invalid http uri")]
    InvalidUri,

    /// Invalid `Content-Length`, or conflicting framing headers.
    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    /// Malformed request body framing.
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    /// A socket read timed out.
    #[error("read timed out")]
    Timeout,

    /// Transport failure while reading.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn uri_too_long(current_size: usize, max_size: usize) -> Self {
        Self::UriTooLong { current_size, max_size }
    }

    pub fn invalid_header<S: ToString>(reason: S) -> Self {
        Self::InvalidHeader { reason: reason.to_string() }
    }

    pub fn invalid_version<S: ToString>(reason: S) -> Self {
        Self::InvalidVersion { reason: reason.to_string() }
    }

    pub fn invalid_body<S: ToString>(reason: S) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(reason: S) -> Self {
        Self::InvalidContentLength { reason: reason.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// The wire status this read failure maps to, if it can be answered at
    /// all. Transport failures return `None`: the connection is terminated
    /// quietly (read-aborted).
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ParseError::TooLargeHeader { .. } | ParseError::TooManyHeaders { .. } => {
                Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
            }
            ParseError::InvalidMethod => Some(StatusCode::NOT_IMPLEMENTED),
            ParseError::UriTooLong { .. } => Some(StatusCode::URI_TOO_LONG),
            ParseError::InvalidHeader { .. }
            | ParseError::InvalidVersion { .. }
            | ParseError::InvalidUri
            | ParseError::InvalidContentLength { .. }
            | ParseError::InvalidBody { .. } => Some(StatusCode::BAD_REQUEST),
            ParseError::Timeout => Some(StatusCode::REQUEST_TIMEOUT),
            ParseError::Io { .. } => None,
        }
    }
}

/// Errors raised while encoding and sending an HTTP response.
#[derive(Error, Debug)]
pub enum SendError {
    /// The response body could not be resolved into wire frames.
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    /// A transfer coding the codec cannot apply.
    #[error("unsupported transfer coding: {coding}")]
    UnsupportedCoding { coding: String },

    /// Transport failure while writing.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(reason: S) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn unsupported_coding<S: ToString>(coding: S) -> Self {
        Self::UnsupportedCoding { coding: coding.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_status_mapping() {
        assert_eq!(
            ParseError::too_large_header(2048, 1024).status(),
            Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
        );
        assert_eq!(ParseError::too_many_headers(10).status(), Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE));
        assert_eq!(ParseError::InvalidMethod.status(), Some(StatusCode::NOT_IMPLEMENTED));
        assert_eq!(ParseError::uri_too_long(9000, 8192).status(), Some(StatusCode::URI_TOO_LONG));
        assert_eq!(ParseError::InvalidUri.status(), Some(StatusCode::BAD_REQUEST));
        assert_eq!(ParseError::invalid_version("HTTP/9").status(), Some(StatusCode::BAD_REQUEST));
        assert_eq!(ParseError::Timeout.status(), Some(StatusCode::REQUEST_TIMEOUT));
        assert!(ParseError::io(io::Error::from(io::ErrorKind::UnexpectedEof)).status().is_none());
    }

    #[test]
    fn abort_detection() {
        let err: BoxError = Box::new(ResponseAborted);
        assert!(is_abort(&err));

        let err: BoxError = Box::new(HttpError::Aborted);
        assert!(is_abort(&err));

        let err: BoxError = Box::new(ParseError::InvalidUri);
        assert!(!is_abort(&err));
    }
}
