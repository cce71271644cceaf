//! Response head encoder.
//!
//! Serializes the status line and the header block. Framing headers
//! (`Content-Length` / `Transfer-Encoding`) are the engine's responsibility:
//! they are decided by the preparation step before the head reaches this
//! encoder, which writes the headers verbatim.

use crate::protocol::{PayloadSize, ResponseHead, SendError};

use bytes::{BufMut, BytesMut};

use http::Version;
use std::io;
use std::io::{ErrorKind, Write};
use tokio_util::codec::Encoder;
use tracing::error;

/// Space reserved up front for a typical head.
const INIT_HEAD_SIZE: usize = 4 * 1024;

pub struct HeaderEncoder;

impl Encoder<(ResponseHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (head, _payload_size) = item;

        dst.reserve(INIT_HEAD_SIZE);
        match head.version() {
            Version::HTTP_11 => {
                write!(
                    FastWrite(dst),
                    "HTTP/1.1 {} {}\r\n",
                    head.status().as_str(),
                    head.status().canonical_reason().unwrap_or("Unknown")
                )?;
            }
            v => {
                error!(http_version = ?v, "unsupported http version on response");
                return Err(io::Error::from(ErrorKind::Unsupported).into());
            }
        }

        for (header_name, header_value) in head.headers().iter() {
            dst.put_slice(header_name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Writer over `BytesMut` so the status line can go through `write!`.
struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Response, StatusCode};

    #[test]
    fn writes_status_line_and_headers_verbatim() {
        let response = Response::builder()
            .status(StatusCode::OK)
            .header("content-length", "2")
            .header("connection", "close")
            .body(())
            .unwrap();
        let head = ResponseHead::from(response);

        let mut dst = BytesMut::new();
        HeaderEncoder.encode((head, PayloadSize::Length(2)), &mut dst).unwrap();

        let text = std::str::from_utf8(&dst).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 2\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn rejects_non_http11_responses() {
        let response = Response::builder().version(Version::HTTP_2).status(StatusCode::OK).body(()).unwrap();
        let head = ResponseHead::from(response);

        let mut dst = BytesMut::new();
        assert!(HeaderEncoder.encode((head, PayloadSize::Empty), &mut dst).is_err());
    }
}
