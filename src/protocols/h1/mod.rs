//! HTTP/1.1 engine (RFC 9112).
//!
//! The codec half ([`parser`], [`encoder`], [`chunked`]) is pure:
//! incremental head parsing out of a growable buffer, canonical head
//! serialization, and a restartable chunked transfer decoder. The
//! connection half ([`client`], [`server`]) layers keep-alive, body
//! framing selection, `Expect: 100-continue` and truncation detection
//! on top.

pub mod chunked;
pub mod client;
pub mod encoder;
pub mod parser;
pub mod server;

pub use client::{ClientConnection, ClientEvent};
pub use parser::H1Limits;
pub use server::{ServerConnection, ServerEvent};

/// Decision table for message body lengths (RFC 9112 §6.3).
pub mod body {
    use crate::error::Error;
    use crate::http::{BodyLength, FieldSection, Method, StatusCode};

    /// Body length of a received request.
    pub fn request_body_length(headers: &FieldSection) -> Result<BodyLength, Error> {
        if headers.contains("transfer-encoding") {
            if headers.contains("content-length") {
                return Err(Error::BadFraming(
                    "both transfer-encoding and content-length".into(),
                ));
            }
            if !headers.has_token("transfer-encoding", "chunked") {
                // A request with a non-chunked transfer coding has no
                // reliable length.
                return Err(Error::BadFraming("transfer-encoding without chunked".into()));
            }
            return Ok(BodyLength::Chunked);
        }
        match content_length(headers)? {
            Some(0) | None => Ok(BodyLength::None),
            Some(n) => Ok(BodyLength::Known(n)),
        }
    }

    /// Body length of a received response to `method`.
    pub fn response_body_length(
        method: &Method,
        status: StatusCode,
        headers: &FieldSection,
    ) -> Result<BodyLength, Error> {
        if *method == Method::Head || status.body_forbidden() {
            return Ok(BodyLength::None);
        }
        if *method == Method::Connect && status.is_success() {
            return Ok(BodyLength::None);
        }
        if headers.contains("transfer-encoding") {
            if headers.contains("content-length") {
                return Err(Error::BadFraming(
                    "both transfer-encoding and content-length".into(),
                ));
            }
            if headers.has_token("transfer-encoding", "chunked") {
                return Ok(BodyLength::Chunked);
            }
            // Non-chunked coded response: delimited by close.
            return Ok(BodyLength::UntilClose);
        }
        match content_length(headers)? {
            Some(n) => Ok(BodyLength::Known(n)),
            None => Ok(BodyLength::UntilClose),
        }
    }

    /// Parses `Content-Length`, rejecting conflicting duplicates.
    pub fn content_length(headers: &FieldSection) -> Result<Option<u64>, Error> {
        let mut result: Option<u64> = None;
        for value in headers.get_all("content-length") {
            let text = std::str::from_utf8(value.as_bytes())
                .map_err(|_| Error::BadFraming("non-ascii content-length".into()))?;
            let parsed: u64 = text
                .trim()
                .parse()
                .map_err(|_| Error::BadFraming(format!("invalid content-length {text:?}")))?;
            match result {
                Some(existing) if existing != parsed => {
                    return Err(Error::BadFraming("conflicting content-length values".into()));
                }
                _ => result = Some(parsed),
            }
        }
        Ok(result)
    }

}
