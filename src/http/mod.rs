//! HTTP message model shared by all three engines.
//!
//! The request/response heads carry the information that HTTP/1.1 puts
//! on the start line and HTTP/2 and HTTP/3 put in pseudo-header fields.
//! Regular fields live in an ordered [`FieldSection`]; pseudo-headers
//! are never representable there, which makes the "pseudo before
//! regular, none in trailers" rules structural rather than checked.

pub mod fields;
pub mod message;
pub mod method;
pub mod status;

pub use fields::{FieldName, FieldSection, FieldValue};
pub use message::{BodyChunk, BodyLength, Request, Response, Scheme};
pub use method::Method;
pub use status::StatusCode;
