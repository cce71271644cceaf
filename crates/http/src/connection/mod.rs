//! The per-connection IO driver.
//!
//! [`Connection`] owns the byte stream and the read/write buffers and drives
//! the codec by hand, so the engine can apply the distinct timeouts the
//! service state machine calls for: the first-byte wait (read timeout on a
//! cold connection, keep-alive timeout between requests) and the per-read
//! timeout that bounds every subsequent socket read while parsing the head
//! or streaming the body.
//!
//! The request body never buffers ahead of the handler: [`BodyPump`] reads
//! payload frames from the socket and feeds them into the request's channel
//! entity while the handler runs, then [`BodyPump::drain`] discards whatever
//! the handler left unread so the connection is positioned at the next
//! request boundary.

pub mod manager;

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::codec::{RequestDecoder, ResponseEncoder};
use crate::protocol::{
    Entity, EntitySender, Message, ParseError, PayloadItem, PayloadSize, RequestHead, ResponseHead, SendError,
};

pub struct Connection<S> {
    io: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    decoder: RequestDecoder,
    encoder: ResponseEncoder,
    buffer_size: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: S, buffer_size: usize, header_limit: usize) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(buffer_size),
            write_buf: BytesMut::with_capacity(buffer_size),
            decoder: RequestDecoder::new(buffer_size, header_limit),
            encoder: ResponseEncoder::new(),
            buffer_size,
        }
    }

    /// Waits until at least one byte of the next request is available.
    ///
    /// Any failure here — EOF, transport error, or the wait timing out — is
    /// a read-abort: the engine closes the connection without a response.
    pub async fn await_first_byte(&mut self, wait: Duration) -> io::Result<()> {
        if !self.read_buf.is_empty() {
            return Ok(());
        }

        self.read_buf.reserve(self.buffer_size);
        let read = tokio::time::timeout(wait, self.io.read_buf(&mut self.read_buf))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;

        if read == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        Ok(())
    }

    /// Reads and parses the next request head. `read_timeout` bounds each
    /// socket read along the way.
    pub async fn read_head(&mut self, read_timeout: Duration) -> Result<(RequestHead, PayloadSize), ParseError> {
        loop {
            match self.decoder.decode(&mut self.read_buf)? {
                Some(Message::Head(head)) => return Ok(head),
                Some(Message::Payload(_)) => {
                    return Err(ParseError::invalid_body("payload frame while expecting a request head"));
                }
                None => self.fill(read_timeout).await?,
            }
        }
    }

    /// Sets up the request body: the channel entity handed to the handler
    /// and the pump that feeds it from the socket.
    pub fn begin_body(&mut self, payload_size: PayloadSize, read_timeout: Duration) -> (Entity, BodyPump<'_, S>) {
        let (entity, sender) = Entity::channel(payload_size);
        (entity, BodyPump { conn: self, sender: Some(sender), read_timeout, done: false })
    }

    async fn next_payload(&mut self, read_timeout: Duration) -> Result<PayloadItem, ParseError> {
        loop {
            match self.decoder.decode(&mut self.read_buf)? {
                Some(Message::Payload(item)) => return Ok(item),
                Some(Message::Head(_)) => {
                    return Err(ParseError::invalid_body("request head while streaming a body"));
                }
                None => self.fill(read_timeout).await?,
            }
        }
    }

    async fn fill(&mut self, read_timeout: Duration) -> Result<(), ParseError> {
        self.read_buf.reserve(self.buffer_size);
        let read = tokio::time::timeout(read_timeout, self.io.read_buf(&mut self.read_buf))
            .await
            .map_err(|_| ParseError::Timeout)?
            .map_err(ParseError::io)?;

        if read == 0 {
            return Err(ParseError::io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }
        Ok(())
    }

    /// Writes one complete response: head, then the entity's frames in the
    /// declared framing. The entity is consumed and released here.
    pub async fn write_response(
        &mut self,
        head: ResponseHead,
        payload_size: PayloadSize,
        mut body: Entity,
    ) -> Result<(), SendError> {
        self.encoder.encode(Message::<_, Bytes>::Head((head, payload_size)), &mut self.write_buf)?;

        if payload_size.is_empty() {
            drop(body);
            return self.flush().await;
        }

        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        return Err(SendError::invalid_body("unexpected trailers in response body"));
                    };
                    self.encoder.encode(Message::Payload(PayloadItem::Chunk(data)), &mut self.write_buf)?;
                    if self.write_buf.len() >= self.buffer_size {
                        self.flush().await?;
                    }
                }
                Some(Err(e)) => {
                    return Err(SendError::invalid_body(format!("resolving response body failed: {e}")));
                }
                None => {
                    self.encoder.encode(Message::Payload(PayloadItem::<Bytes>::Eof), &mut self.write_buf)?;
                    return self.flush().await;
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<(), SendError> {
        if !self.write_buf.is_empty() {
            let buffered = self.write_buf.split();
            self.io.write_all(&buffered).await.map_err(SendError::io)?;
        }
        self.io.flush().await.map_err(SendError::io)
    }

    /// Yields the raw stream for an upgrade handoff, together with any bytes
    /// already buffered past the current request.
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.io, self.read_buf)
    }

    /// Closes the transport gracefully.
    pub async fn shutdown(mut self) {
        let _ = self.io.shutdown().await;
    }
}

/// Feeds request-body frames from the socket into the channel entity while
/// the handler runs.
pub struct BodyPump<'conn, S> {
    conn: &'conn mut Connection<S>,
    sender: Option<EntitySender>,
    read_timeout: Duration,
    done: bool,
}

impl<S> BodyPump<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// True once the body has been fully consumed from the socket.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Advances the pump by one payload frame.
    ///
    /// Cancel-safe with respect to the socket: a frame interrupted between
    /// read and delivery is at worst discarded, which only matters once the
    /// handler has stopped reading — at that point the remainder is
    /// discarded anyway by [`BodyPump::drain`].
    pub async fn step(&mut self) {
        if self.done {
            return;
        }

        match self.conn.next_payload(self.read_timeout).await {
            Ok(PayloadItem::Chunk(bytes)) => {
                if let Some(sender) = &self.sender {
                    if sender.is_closed() {
                        // handler dropped the entity; read on, discarding
                        self.sender = None;
                    } else if !sender.feed(Ok(bytes)).await {
                        self.sender = None;
                    }
                }
            }
            Ok(PayloadItem::Eof) => {
                trace!("request body complete");
                self.sender = None;
                self.done = true;
            }
            Err(e) => {
                if let Some(sender) = self.sender.take() {
                    let _ = sender.feed(Err(e.into())).await;
                    self.done = true;
                } else {
                    self.done = true;
                }
            }
        }
    }

    /// Discards whatever the handler left unread, leaving the connection at
    /// the next request boundary.
    pub async fn drain(mut self) -> Result<(), ParseError> {
        self.sender = None;
        while !self.done {
            match self.conn.next_payload(self.read_timeout).await {
                Ok(PayloadItem::Chunk(_)) => {}
                Ok(PayloadItem::Eof) => self.done = true,
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Response, StatusCode};

    fn response_head(status: StatusCode, headers: &[(&str, &str)]) -> ResponseHead {
        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        ResponseHead::from(builder.body(()).unwrap())
    }

    #[tokio::test]
    async fn reads_a_simple_request() {
        let (client, server) = tokio::io::duplex(4096);
        let mut conn = Connection::new(server, 1024, 100);

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"GET /about HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

        conn.await_first_byte(Duration::from_millis(200)).await.unwrap();
        let (head, payload_size) = conn.read_head(Duration::from_millis(200)).await.unwrap();

        assert_eq!(head.method(), http::Method::GET);
        assert_eq!(head.uri().path(), "/about");
        assert!(payload_size.is_empty());

        let head = response_head(StatusCode::OK, &[("content-length", "2"), ("connection", "close")]);
        conn.write_response(head, PayloadSize::Length(2), Entity::full("hi")).await.unwrap();

        drop(conn);
        let mut wire = Vec::new();
        client_read.read_to_end(&mut wire).await.unwrap();
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[tokio::test]
    async fn first_byte_timeout_is_reported() {
        let (_client, server) = tokio::io::duplex(64);
        let mut conn = Connection::new(server, 1024, 100);

        let err = conn.await_first_byte(Duration::from_millis(30)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn eof_on_first_byte_is_reported() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut conn = Connection::new(server, 1024, 100);

        let err = conn.await_first_byte(Duration::from_millis(30)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn body_pump_feeds_the_entity_and_drains_the_rest() {
        let (client, server) = tokio::io::duplex(4096);
        let mut conn = Connection::new(server, 1024, 100);

        let (_client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(b"POST /in HTTP/1.1\r\ncontent-length: 6\r\n\r\nabcdefGET /next HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        conn.await_first_byte(Duration::from_millis(200)).await.unwrap();
        let (_, payload_size) = conn.read_head(Duration::from_millis(200)).await.unwrap();
        assert_eq!(payload_size, PayloadSize::Length(6));

        let (mut entity, mut pump) = conn.begin_body(payload_size, Duration::from_millis(200));

        // read only part of the body, then drop the entity
        pump.step().await;
        let first = entity.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(&first[..], b"abcdef");
        drop(entity);

        pump.drain().await.unwrap();

        // the connection is positioned at the next request
        let (head, _) = conn.read_head(Duration::from_millis(200)).await.unwrap();
        assert_eq!(head.uri().path(), "/next");
    }

    #[tokio::test]
    async fn chunked_response_bytes_on_the_wire() {
        let (client, server) = tokio::io::duplex(4096);
        let mut conn = Connection::new(server, 1024, 100);

        let chunks = futures::stream::iter(
            [Bytes::from_static(b"abcde"), Bytes::from_static(b"fghij"), Bytes::from_static(b"klmno")]
                .map(io::Result::Ok),
        );
        let head = response_head(StatusCode::OK, &[("transfer-encoding", "chunked"), ("connection", "close")]);
        conn.write_response(head, PayloadSize::Chunked, Entity::stream(None, chunks)).await.unwrap();
        drop(conn);

        let (mut client_read, client_write) = tokio::io::split(client);
        drop(client_write);
        let mut wire = Vec::new();
        client_read.read_to_end(&mut wire).await.unwrap();
        let text = String::from_utf8(wire).unwrap();
        assert!(text.ends_with("\r\n\r\n5\r\nabcde\r\n5\r\nfghij\r\n5\r\nklmno\r\n0\r\n\r\n"));
    }
}
