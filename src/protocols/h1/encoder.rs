//! HTTP/1.1 head serialization.

use crate::error::Error;
use crate::http::{BodyLength, Request, Response};

/// Serializes a request head, synthesizing `Host` from the authority
/// when the caller did not set one and the framing headers from the
/// body descriptor.
pub fn encode_request(request: &Request, out: &mut Vec<u8>) -> Result<(), Error> {
    request.validate(false)?;

    out.extend_from_slice(request.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    if !request.headers.contains("host") {
        out.extend_from_slice(b"host: ");
        out.extend_from_slice(request.authority.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    write_framing(request.body, &request.headers, out)?;
    write_fields(&request.headers, out);
    out.extend_from_slice(b"\r\n");
    Ok(())
}

/// Serializes a response head.
pub fn encode_response(response: &Response, out: &mut Vec<u8>) -> Result<(), Error> {
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(response.status.to_string().as_bytes());
    out.push(b' ');
    if response.reason.is_empty() {
        out.extend_from_slice(response.status.canonical_reason().as_bytes());
    } else {
        out.extend_from_slice(response.reason.as_bytes());
    }
    out.extend_from_slice(b"\r\n");

    if !response.status.body_forbidden() {
        write_framing(response.body, &response.headers, out)?;
    }
    write_fields(&response.headers, out);
    out.extend_from_slice(b"\r\n");
    Ok(())
}

/// Emits `content-length` or `transfer-encoding` for the declared body
/// unless the caller already supplied one.
fn write_framing(
    body: BodyLength,
    headers: &crate::http::FieldSection,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    if headers.contains("content-length") || headers.contains("transfer-encoding") {
        return Ok(());
    }
    match body {
        BodyLength::Known(n) => {
            out.extend_from_slice(b"content-length: ");
            out.extend_from_slice(n.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        BodyLength::Chunked => {
            out.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
        BodyLength::None | BodyLength::UntilClose => {}
    }
    Ok(())
}

fn write_fields(headers: &crate::http::FieldSection, out: &mut Vec<u8>) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use crate::http::{Method, Scheme, StatusCode};

    use super::*;

    #[test]
    fn request_head_synthesizes_host_and_length() {
        let mut request = Request::get("example.com:8443", "/a/b");
        request.method = Method::Post;
        request.scheme = Scheme::Https;
        request.body = BodyLength::Known(4);
        request.headers.try_append(b"accept", "*/*").unwrap();

        let mut out = Vec::new();
        encode_request(&request, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("POST /a/b HTTP/1.1\r\n"));
        assert!(text.contains("host: example.com:8443\r\n"));
        assert!(text.contains("content-length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_head_uses_canonical_reason() {
        let mut response = Response::new(StatusCode::OK);
        response.body = BodyLength::Chunked;
        let mut out = Vec::new();
        encode_response(&response, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("transfer-encoding: chunked\r\n"));
    }
}
