//! Payload codecs: chunked transfer encoding and fixed-length transfers,
//! behind the unified [`PayloadDecoder`] / [`PayloadEncoder`] pair, plus the
//! write-side content-coding wrappers (gzip, deflate).

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub(crate) mod compress;

pub use compress::ContentCoding;
pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
