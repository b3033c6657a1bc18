//! Request and response heads plus body framing descriptors.

use bytes::Bytes;

use crate::error::Error;

use super::fields::{FieldSection, FieldValue};
use super::method::Method;
use super::status::StatusCode;

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// No body at all (HEAD responses, 1xx/204/304, bodiless requests).
    None,
    /// Exactly this many bytes (`Content-Length` or H2/H3 annotation).
    Known(u64),
    /// Chunked transfer coding (HTTP/1.1 only).
    Chunked,
    /// Body runs until the peer closes the connection (H1 responses only).
    UntilClose,
}

impl BodyLength {
    #[inline]
    #[must_use]
    pub fn is_none(self) -> bool {
        matches!(self, BodyLength::None)
    }
}

/// A request head.
///
/// `scheme` and `authority` correspond to the `:scheme` and
/// `:authority` pseudo-headers on H2/H3; on HTTP/1.1 the authority is
/// carried as `Host` and the scheme is implied by the transport.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Origin-form path-and-query (`/index.html?q=1`), or absolute-form
    /// when talking to a proxy.
    pub target: String,
    pub scheme: Scheme,
    /// `host[:port]`.
    pub authority: String,
    pub headers: FieldSection,
    pub trailers: FieldSection,
    pub body: BodyLength,
}

impl Request {
    /// Minimal GET request for `target` against `authority`.
    #[must_use]
    pub fn get(authority: &str, target: &str) -> Self {
        Request {
            method: Method::Get,
            target: target.to_owned(),
            scheme: Scheme::Https,
            authority: authority.to_owned(),
            headers: FieldSection::new(),
            trailers: FieldSection::new(),
            body: BodyLength::None,
        }
    }

    /// Validates cross-field invariants that individual setters cannot
    /// see: a non-empty target and authority, and no connection-specific
    /// headers when the request will travel over H2/H3.
    pub fn validate(&self, multiplexed: bool) -> Result<(), Error> {
        if self.target.is_empty() {
            return Err(Error::MalformedMessage("empty request target".into()));
        }
        if self.authority.is_empty() {
            return Err(Error::MalformedMessage("empty authority".into()));
        }
        if multiplexed {
            for name in super::fields::CONNECTION_SPECIFIC {
                if self.headers.contains(name) {
                    return Err(Error::MalformedMessage(format!(
                        "connection-specific header {name} is forbidden on h2/h3"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A response head.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    /// Advisory reason phrase; empty for H2/H3 where none exists.
    pub reason: String,
    pub headers: FieldSection,
    pub trailers: FieldSection,
    pub body: BodyLength,
}

impl Response {
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            reason: String::new(),
            headers: FieldSection::new(),
            trailers: FieldSection::new(),
            body: BodyLength::None,
        }
    }

    /// The 500 the server engines synthesize when a handler returns
    /// without producing a response.
    #[must_use]
    pub fn internal_error() -> Self {
        let mut response = Response::new(StatusCode::INTERNAL_SERVER_ERROR);
        response.body = BodyLength::Known(0);
        response
    }
}

/// Request scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A piece of a message body, as delivered to or produced by an engine.
#[derive(Debug, Clone)]
pub struct BodyChunk {
    pub data: Bytes,
    /// True when this chunk ends the body.
    pub end: bool,
}

/// Synthesizes the `host` field H1 requires from an authority, used
/// when a request decoded from H2/H3 is re-serialized or handed to
/// handler code expecting HTTP/1.1 semantics.
pub fn host_from_authority(authority: &str) -> Result<FieldValue, Error> {
    FieldValue::new(Bytes::copy_from_slice(authority.as_bytes()))
}
