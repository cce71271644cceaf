use bytes::{Buf, Bytes};

use crate::protocol::entity::Entity;

/// A framed unit travelling through the codec: either the head of a message
/// or one item of its payload stream.
///
/// `T` is the head type (request head on the read side, response head plus
/// framing on the write side); `Data` is the payload chunk type.
pub enum Message<T, Data: Buf = Bytes> {
    Head(T),
    Payload(PayloadItem<Data>),
}

/// One item of a payload stream: a chunk of bytes or the end marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    Chunk(Data),
    Eof,
}

/// How a message body is framed on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// Body with a known length (`Content-Length`).
    Length(u64),
    /// Body using chunked transfer encoding.
    Chunked,
    /// No body bytes follow the head.
    Empty,
}

impl PayloadSize {
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadSize::Chunked)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty)
    }
}

impl<T> Message<T> {
    #[inline]
    pub fn is_payload(&self) -> bool {
        matches!(self, Message::Payload(_))
    }

    #[inline]
    pub fn is_head(&self) -> bool {
        matches!(self, Message::Head(_))
    }

    pub fn into_payload_item(self) -> Option<PayloadItem> {
        match self {
            Message::Head(_) => None,
            Message::Payload(payload_item) => Some(payload_item),
        }
    }
}

impl<D: Buf> PayloadItem<D> {
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }

    #[inline]
    pub fn is_chunk(&self) -> bool {
        matches!(self, PayloadItem::Chunk(_))
    }
}

impl PayloadItem {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            PayloadItem::Chunk(bytes) => Some(bytes),
            PayloadItem::Eof => None,
        }
    }

    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            PayloadItem::Chunk(bytes) => Some(bytes),
            PayloadItem::Eof => None,
        }
    }
}

/// What a request handler produced.
///
/// A handler either satisfies the request and responds, or forwards the
/// (possibly transformed) request so the next element in the chain can try.
/// The service engine answers `404 Not Found` when the whole chain forwards.
pub enum Flow {
    /// Not satisfied; continue with this request.
    Forward(http::Request<Entity>),
    /// Satisfied; this is the answer.
    Respond(http::Response<Entity>),
}

impl Flow {
    #[inline]
    pub fn is_respond(&self) -> bool {
        matches!(self, Flow::Respond(_))
    }

    pub fn into_response(self) -> Option<http::Response<Entity>> {
        match self {
            Flow::Forward(_) => None,
            Flow::Respond(response) => Some(response),
        }
    }
}
