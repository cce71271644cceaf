//! Request-head decoding and response-head encoding.

mod header_decoder;
mod header_encoder;

pub use header_decoder::HeaderDecoder;
pub(crate) use header_decoder::ends_in_chunked;
pub use header_encoder::HeaderEncoder;
