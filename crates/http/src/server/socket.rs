//! The pluggable socket seam.
//!
//! The engine accepts TCP connections itself; a [`SocketFactory`] turns each
//! accepted stream into the byte stream the connection driver reads and
//! writes. The plain factory passes the TCP stream through; a TLS factory is
//! an external collaborator that performs its handshake here and returns the
//! encrypted stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Object-safe alias for the byte streams the engine drives.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// A served connection's byte stream.
pub type ServerStream = Box<dyn StreamIo>;

/// Produces the byte stream served for an accepted TCP connection.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn handshake(&self, stream: TcpStream) -> io::Result<ServerStream>;
}

/// Plain TCP, no transport security.
pub struct PlainSocketFactory;

#[async_trait]
impl SocketFactory for PlainSocketFactory {
    async fn handshake(&self, stream: TcpStream) -> io::Result<ServerStream> {
        Ok(Box::new(stream))
    }
}

/// A stream with bytes already read off the socket put back in front.
///
/// Used at upgrade handoff: anything the connection buffered past the
/// upgrade request belongs to the upgraded protocol.
pub(crate) struct PrefixedIo {
    prefix: BytesMut,
    inner: ServerStream,
}

impl PrefixedIo {
    pub(crate) fn new(prefix: BytesMut, inner: ServerStream) -> Self {
        Self { prefix, inner }
    }
}

impl AsyncRead for PrefixedIo {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let len = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(len));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedIo {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
