//! The HTTP/1.1 wire codec: a streaming [`RequestDecoder`] and
//! [`ResponseEncoder`] built from head and payload codecs, plus the
//! write-side content-coding wrappers.
//!
//! Both sides are tokio-util [`Decoder`](tokio_util::codec::Decoder) /
//! [`Encoder`](tokio_util::codec::Encoder) implementations; the connection
//! layer drives them over its own read/write buffers so socket timeouts can
//! be applied per read.

pub mod body;
pub mod header;

mod request_decoder;
mod response_encoder;

pub use body::ContentCoding;
pub use request_decoder::RequestDecoder;
pub use response_encoder::ResponseEncoder;
