//! Protocol vocabulary shared by the codec, the connection driver and the
//! service engine: message framing, the body entity, typed attributes and
//! the error taxonomy.

mod message;
pub use message::Flow;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod entity;
pub use entity::Entity;
pub(crate) use entity::EntitySender;

mod request;
pub use request::RequestHead;

mod response;
pub use response::ResponseHead;

mod error;
pub use error::BoxError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::ResponseAborted;
pub use error::SendError;
pub use error::is_abort;

pub mod attributes;

/// A full request as the pipeline sees it.
pub type HttpRequest = http::Request<Entity>;

/// A full response as the pipeline sees it.
pub type HttpResponse = http::Response<Entity>;
