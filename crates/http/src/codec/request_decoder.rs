//! Streaming request decoder.
//!
//! Two-phase state machine: while `payload_decoder` is `None` the head is
//! being parsed; once a head is produced the matching [`PayloadDecoder`]
//! takes over until it yields `Eof`.

use crate::codec::body::PayloadDecoder;
use crate::codec::header::HeaderDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHead};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

pub struct RequestDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    /// `buffer_size` bounds the request line and each header line;
    /// `header_limit` bounds the header count, and together they bound the
    /// header block (`header_limit * buffer_size` bytes).
    pub fn new(buffer_size: usize, header_limit: usize) -> Self {
        Self { header_decoder: HeaderDecoder::new(buffer_size, header_limit), payload_decoder: None }
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(RequestHead, PayloadSize)>;
    type Error = ParseError;

    /// Yields `Message::Head` once per request, then `Message::Payload`
    /// items until `Eof`, then the next request's head, and so on.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(item @ PayloadItem::Eof) => {
                    // this request's body is complete
                    self.payload_decoder.take();
                    Some(Message::Payload(item))
                }
                None => None,
            };

            return Ok(message);
        }

        let message = match self.header_decoder.decode(src)? {
            Some((head, payload_size)) => {
                self.payload_decoder = Some(payload_size.into());
                Some(Message::Head((head, payload_size)))
            }
            None => None,
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_then_payload_then_next_head() {
        let mut decoder = RequestDecoder::new(1024, 100);
        let mut buf = BytesMut::from(
            "POST /a HTTP/1.1\r\ncontent-length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n",
        );

        let head = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(head.is_head());

        let chunk = decoder.decode(&mut buf).unwrap().unwrap().into_payload_item().unwrap();
        assert_eq!(&chunk.into_bytes().unwrap()[..], b"abc");

        let eof = decoder.decode(&mut buf).unwrap().unwrap().into_payload_item().unwrap();
        assert!(eof.is_eof());

        let next = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(next.is_head());
    }

    #[test]
    fn bodiless_request_yields_immediate_eof() {
        let mut decoder = RequestDecoder::new(1024, 100);
        let mut buf = BytesMut::from("GET / HTTP/1.1\r\nHost: x\r\n\r\n");

        assert!(decoder.decode(&mut buf).unwrap().unwrap().is_head());
        let eof = decoder.decode(&mut buf).unwrap().unwrap().into_payload_item().unwrap();
        assert!(eof.is_eof());
    }
}
