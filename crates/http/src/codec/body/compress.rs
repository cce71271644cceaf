//! Write-side content codings.
//!
//! When a response's `Transfer-Encoding` lists codings before `chunked`, the
//! body entity is wrapped with the matching compressor before framing:
//! deflate compresses synchronously inside the write loop, gzip compresses
//! in a background task (scheduled on the encoder pool, whose overflow
//! policy never drops work) feeding a channel entity.

use std::io;
use std::io::Write;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::write::{DeflateEncoder, GzEncoder};
use futures::Stream;
use http_body::Body;
use http_body_util::BodyExt;

use crate::protocol::{Entity, PayloadSize, SendError};

/// A transfer coding the codec can apply on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    Deflate,
}

impl ContentCoding {
    /// Parses one coding token of a `Transfer-Encoding` list. `identity` is
    /// a no-op, anything unknown is a fatal send error.
    pub fn parse(token: &str) -> Result<Option<Self>, SendError> {
        match token.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Ok(Some(ContentCoding::Gzip)),
            "deflate" => Ok(Some(ContentCoding::Deflate)),
            "identity" | "" => Ok(None),
            other => Err(SendError::unsupported_coding(other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContentCoding::Gzip => "gzip",
            ContentCoding::Deflate => "deflate",
        }
    }
}

/// Wraps `entity` with a synchronous deflate compressor.
pub(crate) fn deflate(entity: Entity) -> Entity {
    Entity::stream(None, DeflateStream::new(entity))
}

/// Wraps `entity` with a gzip compressor running apart from the write loop.
/// Returns the compressed entity and the compression task; the caller
/// schedules the task on the encoder pool.
pub(crate) fn gzip(entity: Entity) -> (Entity, impl Future<Output = ()> + Send + 'static) {
    let (out, sender) = Entity::channel(PayloadSize::Chunked);

    let task = async move {
        let mut entity = entity;
        let mut encoder = GzEncoder::new(Writer::default(), Compression::default());

        loop {
            match entity.frame().await {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        let _ = sender.feed(Err(SendError::invalid_body("unexpected trailers in body").into())).await;
                        return;
                    };
                    if let Err(e) = encoder.write_all(&data) {
                        let _ = sender.feed(Err(SendError::io(e).into())).await;
                        return;
                    }
                    let compressed = encoder.get_mut().take();
                    if !compressed.is_empty() && !sender.feed(Ok(compressed)).await {
                        // consumer gone, nothing left to do
                        return;
                    }
                }
                Some(Err(e)) => {
                    let _ = sender.feed(Err(e)).await;
                    return;
                }
                None => break,
            }
        }

        match encoder.finish() {
            Ok(writer) => {
                let tail = writer.buf.freeze();
                if !tail.is_empty() {
                    let _ = sender.feed(Ok(tail)).await;
                }
            }
            Err(e) => {
                let _ = sender.feed(Err(SendError::io(e).into())).await;
            }
        }
    };

    (out, task)
}

/// Deflate applied inline while the write loop polls the body.
struct DeflateStream {
    inner: Entity,
    encoder: Option<DeflateEncoder<Writer>>,
}

impl DeflateStream {
    fn new(inner: Entity) -> Self {
        Self { inner, encoder: Some(DeflateEncoder::new(Writer::default(), Compression::default())) }
    }
}

impl Stream for DeflateStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(encoder) = this.encoder.as_mut() else {
                return Poll::Ready(None);
            };

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        this.encoder = None;
                        return Poll::Ready(Some(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "unexpected trailers in body",
                        ))));
                    };
                    if let Err(e) = encoder.write_all(&data) {
                        this.encoder = None;
                        return Poll::Ready(Some(Err(e)));
                    }
                    let compressed = encoder.get_mut().take();
                    if compressed.is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(compressed)));
                }
                Some(Err(e)) => {
                    this.encoder = None;
                    return Poll::Ready(Some(Err(io::Error::other(e))));
                }
                None => {
                    let encoder = this.encoder.take().expect("encoder present in loop");
                    return match encoder.finish() {
                        Ok(writer) => {
                            let tail = writer.buf.freeze();
                            if tail.is_empty() { Poll::Ready(None) } else { Poll::Ready(Some(Ok(tail))) }
                        }
                        Err(e) => Poll::Ready(Some(Err(e))),
                    };
                }
            }
        }
    }
}

/// `io::Write` sink over `BytesMut` the flate2 encoders write into.
#[derive(Default)]
struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::{DeflateDecoder, GzDecoder};
    use std::io::Read;

    async fn collect(mut entity: Entity) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(frame) = entity.frame().await {
            out.extend_from_slice(&frame.unwrap().into_data().unwrap());
        }
        out
    }

    #[test]
    fn parses_coding_tokens() {
        assert_eq!(ContentCoding::parse("gzip").unwrap(), Some(ContentCoding::Gzip));
        assert_eq!(ContentCoding::parse(" Deflate ").unwrap(), Some(ContentCoding::Deflate));
        assert_eq!(ContentCoding::parse("identity").unwrap(), None);
        assert!(ContentCoding::parse("br").is_err());
    }

    #[tokio::test]
    async fn deflate_round_trips() {
        let body = b"hello hello hello hello hello".repeat(10);
        let compressed = collect(deflate(Entity::full(body.clone()))).await;

        let mut decoder = DeflateDecoder::new(&compressed[..]);
        let mut plain = Vec::new();
        decoder.read_to_end(&mut plain).unwrap();
        assert_eq!(plain, body);
    }

    #[tokio::test]
    async fn gzip_round_trips() {
        let body = b"stream me ".repeat(100);
        let (entity, task) = gzip(Entity::full(body.clone()));
        tokio::spawn(task);

        let compressed = collect(entity).await;
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut plain = Vec::new();
        decoder.read_to_end(&mut plain).unwrap();
        assert_eq!(plain, body);
    }
}
