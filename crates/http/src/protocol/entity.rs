//! The message body entity: a lazy byte producer with an optional known size.
//!
//! An [`Entity`] owns whatever is behind it (a buffer, an open file, a
//! stream, or the connection-fed channel of an incoming request body) and
//! releases it on drop. The service engine drops both the filtered and the
//! unfiltered entity of every response on every exit path.
//!
//! `Entity` implements [`http_body::Body`], which is how the connection
//! layer pulls frames out of it during the write step.

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::Stream;
use futures::stream::BoxStream;
use http_body::{Body, Frame, SizeHint};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use crate::protocol::{HttpError, PayloadSize, SendError};

/// Channel depth for connection-fed bodies; small, the socket provides the
/// real backpressure.
const CHANNEL_DEPTH: usize = 8;

/// A lazy byte producer with an optional known size.
pub struct Entity {
    kind: Kind,
}

enum Kind {
    Empty,
    Full(Option<Bytes>),
    Stream { size: Option<u64>, stream: BoxStream<'static, io::Result<Bytes>> },
    Channel { size: Option<u64>, rx: mpsc::Receiver<Result<Bytes, HttpError>>, done: bool },
}

impl Entity {
    /// An entity with no bytes at all.
    pub fn empty() -> Self {
        Self { kind: Kind::Empty }
    }

    /// An entity backed by an in-memory buffer; the size is known.
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() { Self::empty() } else { Self { kind: Kind::Full(Some(bytes)) } }
    }

    /// An entity that reads an open file; `len` is the file length and
    /// becomes the known size. The file handle is owned and closed on drop.
    pub fn file(file: tokio::fs::File, len: u64) -> Self {
        let stream = ReaderStream::with_capacity(file, 8 * 1024);
        Self { kind: Kind::Stream { size: Some(len), stream: Box::pin(stream) } }
    }

    /// An entity backed by a generic byte stream, with an optional known
    /// size. An unknown size makes the response chunked on the wire.
    pub fn stream<S>(size: Option<u64>, stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self { kind: Kind::Stream { size, stream: Box::pin(stream) } }
    }

    /// An entity fed chunk-by-chunk from elsewhere (the connection's body
    /// pump, or a background compression task). Returns the consumer half
    /// and the producing [`EntitySender`].
    pub(crate) fn channel(size: PayloadSize) -> (Self, EntitySender) {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let size = match size {
            PayloadSize::Length(n) => Some(n),
            PayloadSize::Chunked => None,
            PayloadSize::Empty => Some(0),
        };
        (Self { kind: Kind::Channel { size, rx, done: false } }, EntitySender { tx })
    }

    /// The known size in bytes, if any.
    pub fn size(&self) -> Option<u64> {
        match &self.kind {
            Kind::Empty => Some(0),
            Kind::Full(bytes) => Some(bytes.as_ref().map_or(0, |b| b.len() as u64)),
            Kind::Stream { size, .. } => *size,
            Kind::Channel { size, .. } => *size,
        }
    }

    /// True when the entity is known to produce no bytes.
    pub fn is_known_empty(&self) -> bool {
        self.size() == Some(0)
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::empty()
    }
}

impl Body for Entity {
    type Data = Bytes;
    type Error = HttpError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().kind {
            Kind::Empty => Poll::Ready(None),
            Kind::Full(bytes) => Poll::Ready(bytes.take().map(|b| Ok(Frame::data(b)))),
            Kind::Stream { stream, .. } => match ready!(stream.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
                Some(Err(e)) => Poll::Ready(Some(Err(SendError::io(e).into()))),
                None => Poll::Ready(None),
            },
            Kind::Channel { rx, done, .. } => {
                if *done {
                    return Poll::Ready(None);
                }
                match ready!(rx.poll_recv(cx)) {
                    Some(Ok(bytes)) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
                    Some(Err(e)) => {
                        *done = true;
                        Poll::Ready(Some(Err(e)))
                    }
                    None => {
                        *done = true;
                        Poll::Ready(None)
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Empty => true,
            Kind::Full(bytes) => bytes.is_none(),
            Kind::Stream { .. } => false,
            Kind::Channel { done, .. } => *done,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self.size() {
            Some(n) => SizeHint::with_exact(n),
            None => SizeHint::new(),
        }
    }
}

impl Debug for Entity {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match &self.kind {
            Kind::Empty => f.write_str("Entity::Empty"),
            Kind::Full(bytes) => write!(f, "Entity::Full({})", bytes.as_ref().map_or(0, Bytes::len)),
            Kind::Stream { size, .. } => write!(f, "Entity::Stream(size={size:?})"),
            Kind::Channel { size, .. } => write!(f, "Entity::Channel(size={size:?})"),
        }
    }
}

impl From<Bytes> for Entity {
    fn from(bytes: Bytes) -> Self {
        Self::full(bytes)
    }
}

impl From<String> for Entity {
    fn from(value: String) -> Self {
        Self::full(Bytes::from(value))
    }
}

impl From<&'static str> for Entity {
    fn from(value: &'static str) -> Self {
        Self::full(Bytes::from_static(value.as_bytes()))
    }
}

impl From<Vec<u8>> for Entity {
    fn from(value: Vec<u8>) -> Self {
        Self::full(Bytes::from(value))
    }
}

impl From<()> for Entity {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

/// The producing half of a channel entity.
pub(crate) struct EntitySender {
    tx: mpsc::Sender<Result<Bytes, HttpError>>,
}

impl EntitySender {
    /// Feeds one chunk. Returns false when the consumer is gone, in which
    /// case the producer should stop feeding (but keep draining its source).
    pub(crate) async fn feed(&self, item: Result<Bytes, HttpError>) -> bool {
        self.tx.send(item).await.is_ok()
    }

    /// True when the consumer half has been dropped.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn known_sizes() {
        assert_eq!(Entity::empty().size(), Some(0));
        assert_eq!(Entity::full("hi").size(), Some(2));
        assert!(Entity::stream(None, futures::stream::empty()).size().is_none());
        assert_eq!(Entity::stream(Some(7), futures::stream::empty()).size(), Some(7));
    }

    #[tokio::test]
    async fn full_entity_yields_once() {
        let mut entity = Entity::full("Hello world");
        assert!(!entity.is_end_stream());

        let bytes = entity.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(bytes, Bytes::from("Hello world"));

        assert!(entity.is_end_stream());
        assert!(entity.frame().await.is_none());
    }

    #[tokio::test]
    async fn empty_entity_has_no_frames() {
        let mut entity = Entity::empty();
        assert!(entity.is_end_stream());
        assert!(entity.frame().await.is_none());
    }

    #[tokio::test]
    async fn channel_entity_streams_until_sender_drops() {
        let (mut entity, sender) = Entity::channel(PayloadSize::Chunked);
        assert!(entity.size().is_none());

        tokio::spawn(async move {
            assert!(sender.feed(Ok(Bytes::from_static(b"abc"))).await);
            assert!(sender.feed(Ok(Bytes::from_static(b"def"))).await);
        });

        assert_eq!(entity.frame().await.unwrap().unwrap().into_data().unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(entity.frame().await.unwrap().unwrap().into_data().unwrap(), Bytes::from_static(b"def"));
        assert!(entity.frame().await.is_none());
        assert!(entity.is_end_stream());
    }
}
