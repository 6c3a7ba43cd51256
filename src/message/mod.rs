//! HTTP message model
//!
//! Plain data types for the two sides of an exchange plus the header store
//! they share:
//!
//! - `Endpoint`: where a request goes (scheme, host, optional IP, port, path, query)
//! - `OutboundRequest`: method, headers and an in-memory or streamed body,
//!   serialized to the HTTP/1.1 wire format by `encode_head`
//! - `InboundResponse`: parsed status line and headers plus the body strategy
//!   chosen while reading it (bytes, empty, or a `BodyStream` handed to the caller)
//! - `HeaderMap`: ordered, case-insensitive header store with `TypedHeader`
//!   fields for the framing headers the transport interprets

pub use endpoint::{Endpoint, Scheme};
pub use headers::{
    ConnectionOptions, ContentLength, HeaderMap, TrailerFields, TransferEncoding, TypedHeader,
};
pub use request::{Method, OutboundRequest, RequestBody};
pub use response::{BodyStream, ConnectionDirective, InboundResponse, ResponseBody};

mod endpoint;
mod headers;
mod request;
mod response;
