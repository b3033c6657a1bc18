//! Incremental HTTP/1.1 head parser.
//!
//! Heads are parsed only once the terminating empty line is buffered,
//! which makes parsing trivially restartable: feeding a byte stream in
//! any prefix split yields the same result as feeding it whole. Limits
//! are enforced against the buffer before the terminator arrives so an
//! endless head cannot grow memory.

use bytes::BytesMut;
use memchr::memmem;

use crate::error::Error;
use crate::http::{FieldSection, Method, StatusCode};

/// Parser limits, enforced before allocation.
#[derive(Debug, Clone, Copy)]
pub struct H1Limits {
    /// Longest permitted start line or field line in bytes.
    pub max_line: usize,
    /// Most field lines permitted in one head.
    pub max_fields: usize,
    /// Largest permitted head (start line through empty line).
    pub max_head_bytes: usize,
}

impl Default for H1Limits {
    fn default() -> Self {
        H1Limits {
            max_line: 8 * 1024,
            max_fields: 100,
            max_head_bytes: 64 * 1024,
        }
    }
}

/// A parsed request head.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: FieldSection,
}

/// A parsed response head.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    pub headers: FieldSection,
}

/// Finds the end of a head (the CRLF CRLF terminator), tolerating bare
/// LF line endings when `lenient_lf` is set. Returns the offset one
/// past the terminator.
fn find_head_end(buf: &[u8], lenient_lf: bool) -> Option<usize> {
    if let Some(at) = memmem::find(buf, b"\r\n\r\n") {
        let strict_end = at + 4;
        if lenient_lf {
            // A bare "\n\n" earlier in the buffer ends the head first.
            if let Some(lf) = memmem::find(&buf[..strict_end], b"\n\n") {
                if lf + 2 < strict_end {
                    return Some(lf + 2);
                }
            }
        }
        return Some(strict_end);
    }
    if lenient_lf {
        memmem::find(buf, b"\n\n").map(|at| at + 2)
    } else {
        None
    }
}

/// Attempts to parse a request head out of `buf`.
///
/// Returns `Ok(None)` until the whole head is buffered; on success the
/// head bytes are consumed from `buf`.
pub fn parse_request(
    buf: &mut BytesMut,
    limits: &H1Limits,
    lenient_lf: bool,
) -> Result<Option<RequestHead>, Error> {
    let Some(end) = find_head_end(buf, lenient_lf) else {
        check_pending(buf, limits)?;
        return Ok(None);
    };
    if end > limits.max_head_bytes {
        return Err(Error::TooLarge(format!("head exceeds {} bytes", limits.max_head_bytes)));
    }

    let head = buf.split_to(end);
    let mut lines = Lines::new(&head, lenient_lf);

    let start = lines
        .next_line(limits)?
        .ok_or_else(|| Error::BadSyntax("empty head".into()))?;
    let (method, target) = parse_request_line(start)?;
    let headers = parse_fields(&mut lines, limits)?;

    Ok(Some(RequestHead { method, target, headers }))
}

/// Attempts to parse a response head out of `buf`. Response heads are
/// always strict CRLF.
pub fn parse_response(buf: &mut BytesMut, limits: &H1Limits) -> Result<Option<ResponseHead>, Error> {
    let Some(end) = find_head_end(buf, false) else {
        check_pending(buf, limits)?;
        return Ok(None);
    };
    if end > limits.max_head_bytes {
        return Err(Error::TooLarge(format!("head exceeds {} bytes", limits.max_head_bytes)));
    }

    let head = buf.split_to(end);
    let mut lines = Lines::new(&head, false);

    let start = lines
        .next_line(limits)?
        .ok_or_else(|| Error::BadSyntax("empty head".into()))?;
    let (status, reason) = parse_status_line(start)?;
    let headers = parse_fields(&mut lines, limits)?;

    Ok(Some(ResponseHead { status, reason, headers }))
}

/// Parses a block of trailer fields (already delimited by the chunked
/// decoder, including the final empty line).
pub fn parse_trailer_fields(raw: &[u8], limits: &H1Limits) -> Result<FieldSection, Error> {
    let mut lines = Lines::new(raw, false);
    parse_fields(&mut lines, limits)
}

fn check_pending(buf: &[u8], limits: &H1Limits) -> Result<(), Error> {
    if buf.len() > limits.max_head_bytes {
        return Err(Error::TooLarge(format!(
            "head exceeds {} bytes before terminator",
            limits.max_head_bytes
        )));
    }
    Ok(())
}

/// Line iterator over a fully buffered head.
struct Lines<'a> {
    rest: &'a [u8],
    lenient_lf: bool,
}

impl<'a> Lines<'a> {
    fn new(head: &'a [u8], lenient_lf: bool) -> Self {
        Lines { rest: head, lenient_lf }
    }

    /// Next line without its terminator; `Ok(None)` at the empty line
    /// or end of input.
    fn next_line(&mut self, limits: &H1Limits) -> Result<Option<&'a [u8]>, Error> {
        if self.rest.is_empty() {
            return Ok(None);
        }
        let lf = memchr::memchr(b'\n', self.rest)
            .ok_or_else(|| Error::BadSyntax("line without terminator".into()))?;
        let (mut line, rest) = self.rest.split_at(lf);
        self.rest = &rest[1..];

        match line.last() {
            Some(b'\r') => line = &line[..line.len() - 1],
            _ if self.lenient_lf => {}
            _ => return Err(Error::BadSyntax("bare LF line ending".into())),
        }
        if line.len() > limits.max_line {
            return Err(Error::TooLarge(format!("line exceeds {} bytes", limits.max_line)));
        }
        if line.is_empty() {
            return Ok(None);
        }
        Ok(Some(line))
    }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String), Error> {
    let mut parts = line.splitn(3, |&b| b == b' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::BadSyntax("missing method".into()))?;
    let target = parts
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::BadSyntax("missing request target".into()))?;
    let version = parts
        .next()
        .ok_or_else(|| Error::BadSyntax("missing http version".into()))?;

    check_version(version)?;
    let method = std::str::from_utf8(method)
        .map_err(|_| Error::BadSyntax("non-ascii method".into()))?
        .parse()?;
    if target.iter().any(|&b| b <= b' ' || b == 0x7f) {
        return Err(Error::BadSyntax("request target contains forbidden bytes".into()));
    }
    let target = String::from_utf8(target.to_vec())
        .map_err(|_| Error::BadSyntax("non-utf8 request target".into()))?;
    Ok((method, target))
}

fn parse_status_line(line: &[u8]) -> Result<(StatusCode, String), Error> {
    let mut parts = line.splitn(3, |&b| b == b' ');
    let version = parts
        .next()
        .ok_or_else(|| Error::BadSyntax("missing http version".into()))?;
    check_version(version)?;

    let code = parts
        .next()
        .ok_or_else(|| Error::BadSyntax("missing status code".into()))?;
    if code.len() != 3 || !code.iter().all(u8::is_ascii_digit) {
        return Err(Error::BadSyntax("malformed status code".into()));
    }
    let code: u16 = std::str::from_utf8(code)
        .expect("digits are ascii")
        .parse()
        .expect("three digits fit u16");
    let status = StatusCode::new(code)?;

    // The reason phrase is advisory and may be absent.
    let reason = parts
        .next()
        .map(|r| String::from_utf8_lossy(r).into_owned())
        .unwrap_or_default();
    Ok((status, reason))
}

fn check_version(version: &[u8]) -> Result<(), Error> {
    match version {
        b"HTTP/1.1" | b"HTTP/1.0" => Ok(()),
        other => Err(Error::UnsupportedVersion(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

fn parse_fields(lines: &mut Lines<'_>, limits: &H1Limits) -> Result<FieldSection, Error> {
    let mut headers = FieldSection::new();
    while let Some(line) = lines.next_line(limits)? {
        if headers.len() >= limits.max_fields {
            return Err(Error::TooLarge(format!("more than {} fields", limits.max_fields)));
        }
        // Obsolete line folding is rejected outright.
        if line[0] == b' ' || line[0] == b'\t' {
            return Err(Error::BadSyntax("obsolete line folding".into()));
        }
        let colon = memchr::memchr(b':', line)
            .ok_or_else(|| Error::BadSyntax("field line without colon".into()))?;
        let (name, rest) = line.split_at(colon);
        // No whitespace is allowed between name and colon.
        if name.last().is_some_and(|b| *b == b' ' || *b == b'\t') {
            return Err(Error::BadSyntax("whitespace before colon".into()));
        }
        let value = rest[1..].trim_ascii();
        headers.try_append(name, value.to_vec())?;
    }
    Ok(headers)
}
