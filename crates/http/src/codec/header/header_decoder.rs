//! Request head decoder.
//!
//! Buffers until the full header block (terminated by an empty line) has
//! arrived, then parses it in one pass: the request line by hand — the
//! engine must tell an over-long target (414) from a malformed method (501)
//! from everything else (400), distinctions `httparse` cannot make — and the
//! header section with [`httparse::parse_headers`] after normalizing
//! obsolete line folding.
//!
//! Limits are enforced while the block is still partial, so a peer cannot
//! grow the buffer unboundedly:
//!
//! - the request line must fit `buffer_size` bytes (else 414),
//! - every header line must fit `buffer_size` bytes (else 431),
//! - at most `header_limit` headers (else 431),
//! - the whole block must fit `header_limit * buffer_size` bytes (else 431).
//!
//! Line folding is accepted on read only: a continuation line (leading SP or
//! HTAB) joins the previous header value with a single space.

use std::borrow::Cow;

use bytes::BytesMut;
use http::{HeaderName, HeaderValue, Method, Request, Uri, Version};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHead};

/// Decoder for the request head, yielding the parsed head and the body
/// framing derived from its headers.
pub struct HeaderDecoder {
    buffer_size: usize,
    header_limit: usize,
}

impl HeaderDecoder {
    pub fn new(buffer_size: usize, header_limit: usize) -> Self {
        Self { buffer_size, header_limit }
    }

    fn block_limit(&self) -> usize {
        self.header_limit * self.buffer_size
    }

    /// Limit checks while the terminating empty line has not arrived yet.
    fn check_partial(&self, src: &[u8]) -> Result<(), ParseError> {
        let Some(line_end) = find_crlf(src) else {
            // still inside the request line
            ensure!(src.len() <= self.buffer_size, ParseError::uri_too_long(src.len(), self.buffer_size));
            return Ok(());
        };

        ensure!(line_end <= self.buffer_size, ParseError::uri_too_long(line_end, self.buffer_size));
        ensure!(src.len() <= self.block_limit(), ParseError::too_large_header(src.len(), self.block_limit()));

        // every header line seen so far, complete or not, must fit the buffer
        let mut rest = &src[line_end + 2..];
        while let Some(end) = find_crlf(rest) {
            ensure!(end <= self.buffer_size, ParseError::too_large_header(end, self.buffer_size));
            rest = &rest[end + 2..];
        }
        ensure!(rest.len() <= self.buffer_size, ParseError::too_large_header(rest.len(), self.buffer_size));

        Ok(())
    }
}

impl Decoder for HeaderDecoder {
    type Item = (RequestHead, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(block_len) = find_terminator(src) else {
            self.check_partial(src)?;
            return Ok(None);
        };

        ensure!(block_len <= self.block_limit(), ParseError::too_large_header(block_len, self.block_limit()));

        let block = src.split_to(block_len).freeze();
        trace!(block_len, "parsed header block");

        let line_end = find_crlf(&block).expect("header block contains a CRLF");
        ensure!(line_end <= self.buffer_size, ParseError::uri_too_long(line_end, self.buffer_size));

        let (method, uri, version) = parse_request_line(&block[..line_end])?;

        // header section including the terminating empty line
        let section = &block[line_end + 2..];
        check_line_lengths(section, self.buffer_size)?;
        let section = unfold(section);

        let mut slots = vec![httparse::EMPTY_HEADER; self.header_limit];
        let parsed = httparse::parse_headers(&section, &mut slots).map_err(|e| match e {
            httparse::Error::TooManyHeaders => ParseError::too_many_headers(self.header_limit),
            e => ParseError::invalid_header(e.to_string()),
        })?;

        let raw_headers = match parsed {
            httparse::Status::Complete((_, raw_headers)) => raw_headers,
            // the terminator is in the buffer, so the section is complete
            httparse::Status::Partial => return Err(ParseError::invalid_header("truncated header section")),
        };

        let mut builder = Request::builder().method(method).uri(uri).version(version);
        let headers = builder.headers_mut().expect("fresh request builder has no error");
        headers.reserve(raw_headers.len());
        for raw in raw_headers {
            let name = HeaderName::from_bytes(raw.name.as_bytes())
                .map_err(|_| ParseError::invalid_header(format!("invalid header name {:?}", raw.name)))?;
            let value = HeaderValue::from_bytes(raw.value)
                .map_err(|_| ParseError::invalid_header(format!("invalid value for header {name}")))?;
            headers.append(name, value);
        }

        let head = RequestHead::from(builder.body(()).expect("request head built from parsed parts"));
        let payload_size = body_framing(&head)?;

        Ok(Some((head, payload_size)))
    }
}

/// Position of the first CRLF, i.e. the content length of the first line.
fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|w| w == b"\r\n")
}

/// Length of the header block including the empty-line terminator, if the
/// terminator has arrived.
fn find_terminator(src: &[u8]) -> Option<usize> {
    if src.starts_with(b"\r\n") {
        // an empty request line is a malformed method, caught downstream
        return Some(2);
    }
    src.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

fn check_line_lengths(section: &[u8], buffer_size: usize) -> Result<(), ParseError> {
    let mut rest = section;
    while let Some(end) = find_crlf(rest) {
        ensure!(end <= buffer_size, ParseError::too_large_header(end, buffer_size));
        rest = &rest[end + 2..];
    }
    Ok(())
}

/// Joins obsolete folded continuation lines onto the previous header value
/// with a single space. Returns the section unchanged when nothing is
/// folded.
fn unfold(section: &[u8]) -> Cow<'_, [u8]> {
    let folded = section.windows(3).any(|w| w[0] == b'\r' && w[1] == b'\n' && (w[2] == b' ' || w[2] == b'\t'));
    if !folded {
        return Cow::Borrowed(section);
    }

    let mut out = Vec::with_capacity(section.len());
    let mut i = 0;
    while i < section.len() {
        if section[i] == b'\r'
            && i + 2 < section.len()
            && section[i + 1] == b'\n'
            && (section[i + 2] == b' ' || section[i + 2] == b'\t')
        {
            out.push(b' ');
            i += 2;
            while i < section.len() && (section[i] == b' ' || section[i] == b'\t') {
                i += 1;
            }
        } else {
            out.push(section[i]);
            i += 1;
        }
    }
    Cow::Owned(out)
}

fn parse_request_line(line: &[u8]) -> Result<(Method, Uri, Version), ParseError> {
    let mut tokens = line.split(|&b| b == b' ');

    let method = tokens.next().unwrap_or_default();
    ensure!(!method.is_empty() && method.iter().copied().all(is_tchar), ParseError::InvalidMethod);
    let method = Method::from_bytes(method).map_err(|_| ParseError::InvalidMethod)?;

    let target = tokens.next().ok_or(ParseError::InvalidUri)?;
    ensure!(!target.is_empty(), ParseError::InvalidUri);
    let uri = std::str::from_utf8(target)
        .map_err(|_| ParseError::InvalidUri)?
        .parse::<Uri>()
        .map_err(|_| ParseError::InvalidUri)?;

    let version = match tokens.next() {
        Some(b"HTTP/1.1") => Version::HTTP_11,
        Some(b"HTTP/1.0") => Version::HTTP_10,
        Some(other) => return Err(ParseError::invalid_version(String::from_utf8_lossy(other))),
        None => return Err(ParseError::invalid_version("missing version token")),
    };
    ensure!(tokens.next().is_none(), ParseError::invalid_version("request line has more than three tokens"));

    Ok((method, uri, version))
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Derives the body framing from the parsed head, per RFC 9112 §6.
///
/// `Content-Length` and `Transfer-Encoding` together are rejected; a
/// `Transfer-Encoding` that does not end in `chunked` means the body runs to
/// EOF, which a server cannot frame, so it is treated as empty.
fn body_framing(head: &RequestHead) -> Result<PayloadSize, ParseError> {
    if !head.can_have_body() {
        return Ok(PayloadSize::Empty);
    }

    let te_header = head.headers().get(http::header::TRANSFER_ENCODING);
    let cl_header = head.headers().get(http::header::CONTENT_LENGTH);

    match (te_header, cl_header) {
        (None, None) => Ok(PayloadSize::Empty),

        (te_value @ Some(_), None) => {
            if ends_in_chunked(te_value) {
                Ok(PayloadSize::Chunked)
            } else {
                Ok(PayloadSize::Empty)
            }
        }

        (None, Some(cl_value)) => {
            let cl_str =
                cl_value.to_str().map_err(|_| ParseError::invalid_content_length("value is not a string"))?;
            let length = cl_str
                .trim()
                .parse::<u64>()
                .map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not a u64")))?;
            Ok(PayloadSize::Length(length))
        }

        (Some(_), Some(_)) => {
            Err(ParseError::invalid_content_length("transfer-encoding and content-length both present"))
        }
    }
}

/// True when `chunked` is the final coding of the Transfer-Encoding list.
pub(crate) fn ends_in_chunked(header_value: Option<&HeaderValue>) -> bool {
    const CHUNKED: &[u8] = b"chunked";
    if let Some(value) = header_value
        && let Some(last) = value.as_bytes().rsplit(|b| *b == b',').next()
    {
        return last.trim_ascii() == CHUNKED;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;
    use indoc::indoc;

    fn decoder() -> HeaderDecoder {
        HeaderDecoder::new(1024, 10)
    }

    fn crlf(text: &str) -> BytesMut {
        BytesMut::from(text.replace('\n', "\r\n").as_str())
    }

    #[test]
    fn from_curl() {
        let mut buf = crlf(indoc! {"
            GET /index.html HTTP/1.1
            Host: 127.0.0.1:8080
            User-Agent: curl/7.79.1
            Accept: */*

        "});

        let (head, payload_size) = decoder().decode(&mut buf).unwrap().unwrap();

        assert!(payload_size.is_empty());
        assert_eq!(head.method(), &Method::GET);
        assert_eq!(head.version(), Version::HTTP_11);
        assert_eq!(head.uri().path(), "/index.html");
        assert_eq!(head.uri().query(), None);

        assert_eq!(head.headers().len(), 3);
        assert_eq!(head.headers().get(http::header::HOST).unwrap(), "127.0.0.1:8080");
        assert_eq!(head.headers().get(http::header::USER_AGENT).unwrap(), "curl/7.79.1");
        assert_eq!(head.headers().get(http::header::ACCEPT).unwrap(), "*/*");
    }

    #[test]
    fn leaves_body_bytes_in_the_buffer() {
        let mut buf = crlf("POST /submit HTTP/1.1\nContent-Length: 3\n\nabc");

        let (_, payload_size) = decoder().decode(&mut buf).unwrap().unwrap();

        assert_eq!(payload_size, PayloadSize::Length(3));
        assert_eq!(&buf[..], b"abc");
    }

    #[test]
    fn needs_more_data_until_terminator() {
        let mut buf = crlf("GET / HTTP/1.1\nHost: x");
        assert!(decoder().decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\r\n\r\n");
        assert!(decoder().decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn folded_header_joins_with_single_space() {
        let mut buf = crlf("GET / HTTP/1.1\nX-Note: first\n   continued\t here\nHost: x\n\n");

        let (head, _) = decoder().decode(&mut buf).unwrap().unwrap();

        assert_eq!(head.headers().get("x-note").unwrap(), "first continued\t here");
        assert_eq!(head.headers().get("host").unwrap(), "x");
    }

    #[test]
    fn empty_method_is_not_implemented() {
        let mut buf = crlf(" / HTTP/1.1\n\n");
        assert!(matches!(decoder().decode(&mut buf), Err(ParseError::InvalidMethod)));
    }

    #[test]
    fn malformed_method_is_not_implemented() {
        let mut buf = crlf("GE T / HTTP/1.1\n\n");
        // splits into four tokens; the method itself is fine, the line is not
        assert!(matches!(decoder().decode(&mut buf), Err(ParseError::InvalidVersion { .. })));

        let mut buf = crlf("G{}T / HTTP/1.1\n\n");
        assert!(matches!(decoder().decode(&mut buf), Err(ParseError::InvalidMethod)));
    }

    #[test]
    fn bad_version_is_bad_request() {
        let mut buf = crlf("GET / HTTP/2.0\n\n");
        let err = decoder().decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn overlong_request_line_is_uri_too_long() {
        let long_target = "a".repeat(2048);
        let mut buf = BytesMut::from(format!("GET /{long_target} HTTP/1.1\r\n\r\n").as_str());

        let err = decoder().decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::URI_TOO_LONG));
    }

    #[test]
    fn overlong_request_line_detected_while_partial() {
        // no CRLF yet, already past the buffer
        let mut buf = BytesMut::from("GET /".as_bytes());
        buf.extend_from_slice("a".repeat(1500).as_bytes());

        let err = decoder().decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::URI_TOO_LONG));
    }

    #[test]
    fn header_line_at_buffer_size_is_accepted() {
        // "X-Big: " + value = exactly 1024 bytes of line content
        let value = "v".repeat(1024 - "X-Big: ".len());
        let mut buf = BytesMut::from(format!("GET / HTTP/1.1\r\nX-Big: {value}\r\n\r\n").as_str());

        let (head, _) = decoder().decode(&mut buf).unwrap().unwrap();
        assert_eq!(head.headers().get("x-big").unwrap().len(), value.len());
    }

    #[test]
    fn header_line_over_buffer_size_is_431() {
        let value = "v".repeat(1025 - "X-Big: ".len());
        let mut buf = BytesMut::from(format!("GET / HTTP/1.1\r\nX-Big: {value}\r\n\r\n").as_str());

        let err = decoder().decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE));
    }

    #[test]
    fn header_count_limit_is_431() {
        let mut ten = String::from("GET / HTTP/1.1\r\n");
        for i in 0..10 {
            ten.push_str(&format!("X-H{i}: {i}\r\n"));
        }
        let mut eleven = ten.clone();
        ten.push_str("\r\n");
        eleven.push_str("X-H10: 10\r\n\r\n");

        let mut buf = BytesMut::from(ten.as_str());
        let (head, _) = decoder().decode(&mut buf).unwrap().unwrap();
        assert_eq!(head.headers().len(), 10);

        let mut buf = BytesMut::from(eleven.as_str());
        let err = decoder().decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE));
    }

    #[test]
    fn chunked_framing_detected() {
        let mut buf = crlf("POST /upload HTTP/1.1\nTransfer-Encoding: gzip, chunked\n\n");
        let (_, payload_size) = decoder().decode(&mut buf).unwrap().unwrap();
        assert!(payload_size.is_chunked());
    }

    #[test]
    fn conflicting_framing_is_rejected() {
        let mut buf = crlf("POST / HTTP/1.1\nContent-Length: 3\nTransfer-Encoding: chunked\n\n");
        let err = decoder().decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), Some(http::StatusCode::BAD_REQUEST));
    }

    #[test]
    fn check_ends_in_chunked() {
        let mut headers = HeaderMap::new();
        assert!(!ends_in_chunked(headers.get(http::header::TRANSFER_ENCODING)));

        headers.insert("Transfer-Encoding", "gzip, chunked".parse().unwrap());
        assert!(ends_in_chunked(headers.get(http::header::TRANSFER_ENCODING)));

        headers.insert("Transfer-Encoding", "chunked, gzip".parse().unwrap());
        assert!(!ends_in_chunked(headers.get(http::header::TRANSFER_ENCODING)));

        headers.insert("Transfer-Encoding", "gzip".parse().unwrap());
        assert!(!ends_in_chunked(headers.get(http::header::TRANSFER_ENCODING)));
    }
}
