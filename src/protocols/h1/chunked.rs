//! Chunked transfer coding (RFC 9112 §7.1).
//!
//! The decoder is a restartable state machine: it consumes whatever is
//! buffered, hands back decoded data, and picks up exactly where it
//! stopped when more bytes arrive.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::Error;
use crate::http::FieldSection;

use super::parser::{self, H1Limits};

/// Largest accepted chunk-size line (hex digits plus extensions).
const MAX_SIZE_LINE: usize = 256;

#[derive(Debug)]
enum State {
    /// Reading the chunk-size line.
    Size,
    /// Reading chunk data, `remaining` bytes to go.
    Data { remaining: u64 },
    /// Expecting the CRLF that closes a data chunk.
    DataEnd,
    /// Reading the optional trailer section after the zero chunk.
    Trailers,
    /// Terminator seen; everything decoded.
    Done,
}

/// Restartable chunked-body decoder.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    limits: H1Limits,
    trailer_buf: BytesMut,
    trailers: Option<FieldSection>,
}

/// Output of one decoding pass.
#[derive(Debug, Default)]
pub struct ChunkedProgress {
    /// Decoded body bytes, in order.
    pub data: Vec<Bytes>,
    /// True once the terminator chunk and trailers are fully consumed.
    pub finished: bool,
}

impl ChunkedDecoder {
    #[must_use]
    pub fn new(limits: H1Limits) -> Self {
        ChunkedDecoder {
            state: State::Size,
            limits,
            trailer_buf: BytesMut::new(),
            trailers: None,
        }
    }

    /// Trailer fields, available after the decoder finished.
    #[must_use]
    pub fn take_trailers(&mut self) -> Option<FieldSection> {
        self.trailers.take()
    }

    /// Consumes as much of `buf` as possible.
    pub fn feed(&mut self, buf: &mut BytesMut) -> Result<ChunkedProgress, Error> {
        let mut progress = ChunkedProgress::default();

        loop {
            match &mut self.state {
                State::Size => {
                    let Some(line_end) = memchr::memchr(b'\n', buf) else {
                        if buf.len() > MAX_SIZE_LINE {
                            return Err(Error::BadChunk("chunk size line overlong".into()));
                        }
                        return Ok(progress);
                    };
                    if line_end > MAX_SIZE_LINE {
                        return Err(Error::BadChunk("chunk size line overlong".into()));
                    }
                    let line = buf.split_to(line_end + 1);
                    let size = parse_size_line(&line)?;
                    self.state = if size == 0 { State::Trailers } else { State::Data { remaining: size } };
                }
                State::Data { remaining } => {
                    if buf.is_empty() {
                        return Ok(progress);
                    }
                    let take = usize::try_from((*remaining).min(buf.len() as u64))
                        .expect("bounded by buf.len()");
                    *remaining -= take as u64;
                    progress.data.push(buf.split_to(take).freeze());
                    if *remaining == 0 {
                        self.state = State::DataEnd;
                    }
                }
                State::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(progress);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Error::BadChunk("missing CRLF after chunk data".into()));
                    }
                    buf.advance(2);
                    self.state = State::Size;
                }
                State::Trailers => {
                    // Accumulate lines until the empty line that closes
                    // the trailer section.
                    let Some(line_end) = memchr::memchr(b'\n', buf) else {
                        if self.trailer_buf.len() + buf.len() > self.limits.max_head_bytes {
                            return Err(Error::TooLarge("trailer section too large".into()));
                        }
                        return Ok(progress);
                    };
                    let line = buf.split_to(line_end + 1);
                    let is_terminal = line.as_ref() == b"\r\n" || line.as_ref() == b"\n";
                    if !is_terminal {
                        self.trailer_buf.extend_from_slice(&line);
                        if self.trailer_buf.len() > self.limits.max_head_bytes {
                            return Err(Error::TooLarge("trailer section too large".into()));
                        }
                        continue;
                    }
                    let fields = parser::parse_trailer_fields(&self.trailer_buf, &self.limits)?;
                    self.trailers = (!fields.is_empty()).then_some(fields);
                    self.state = State::Done;
                    progress.finished = true;
                    return Ok(progress);
                }
                State::Done => {
                    progress.finished = true;
                    return Ok(progress);
                }
            }
        }
    }
}

/// Parses `SIZE[;extensions]CRLF`, discarding extensions.
fn parse_size_line(line: &[u8]) -> Result<u64, Error> {
    let line = strip_line_ending(line)?;
    let hex = match memchr::memchr(b';', line) {
        Some(at) => &line[..at],
        None => line,
    };
    let hex = hex.trim_ascii();
    if hex.is_empty() || hex.len() > 16 {
        return Err(Error::BadChunk("chunk size missing or overflows 64 bits".into()));
    }
    let mut size: u64 = 0;
    for &b in hex {
        let digit = match b {
            b'0'..=b'9' => u64::from(b - b'0'),
            b'a'..=b'f' => u64::from(b - b'a' + 10),
            b'A'..=b'F' => u64::from(b - b'A' + 10),
            _ => return Err(Error::BadChunk(format!("invalid chunk size digit {b:#x}"))),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit))
            .ok_or_else(|| Error::BadChunk("chunk size overflows 64 bits".into()))?;
    }
    Ok(size)
}

fn strip_line_ending(line: &[u8]) -> Result<&[u8], Error> {
    match line {
        [rest @ .., b'\r', b'\n'] => Ok(rest),
        [rest @ .., b'\n'] => Ok(rest),
        _ => Err(Error::BadChunk("chunk line without terminator".into())),
    }
}

/// Writes one data chunk in chunked coding.
pub fn encode_chunk(data: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

/// Writes the terminator chunk, with trailers when present.
pub fn encode_terminator(trailers: Option<&FieldSection>, out: &mut Vec<u8>) {
    out.extend_from_slice(b"0\r\n");
    if let Some(trailers) = trailers {
        for (name, value) in trailers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (Vec<u8>, Option<FieldSection>) {
        let mut decoder = ChunkedDecoder::new(H1Limits::default());
        let mut buf = BytesMut::from(input);
        let progress = decoder.feed(&mut buf).unwrap();
        assert!(progress.finished);
        let body: Vec<u8> = progress.data.iter().flat_map(|b| b.iter().copied()).collect();
        (body, decoder.take_trailers())
    }

    #[test]
    fn decodes_hello_world() {
        let (body, trailers) = decode_all(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");
        assert_eq!(body, b"hello world");
        assert!(trailers.is_none());
    }

    #[test]
    fn extensions_are_discarded() {
        let (body, _) = decode_all(b"5;name=value\r\nhello\r\n0\r\n\r\n");
        assert_eq!(body, b"hello");
    }

    #[test]
    fn trailers_are_parsed() {
        let (body, trailers) = decode_all(b"2\r\nok\r\n0\r\nX-Sum: abc\r\n\r\n");
        assert_eq!(body, b"ok");
        let trailers = trailers.unwrap();
        assert_eq!(trailers.get("x-sum").unwrap().as_bytes(), b"abc");
    }

    #[test]
    fn restartable_at_every_split_point() {
        let input = b"3\r\nabc\r\n8;ext=1\r\ndefghijk\r\n0\r\nX-T: 1\r\n\r\n";
        for cut in 0..input.len() {
            let mut decoder = ChunkedDecoder::new(H1Limits::default());
            let mut buf = BytesMut::from(&input[..cut]);
            let mut body = Vec::new();
            let first = decoder.feed(&mut buf).unwrap();
            for b in &first.data {
                body.extend_from_slice(b);
            }
            buf.extend_from_slice(&input[cut..]);
            let second = decoder.feed(&mut buf).unwrap();
            for b in &second.data {
                body.extend_from_slice(b);
            }
            assert!(second.finished, "cut={cut}");
            assert_eq!(body, b"abcdefghijk", "cut={cut}");
            assert!(decoder.take_trailers().is_some());
        }
    }

    #[test]
    fn chunk_size_overflow_is_rejected() {
        let mut decoder = ChunkedDecoder::new(H1Limits::default());
        let mut buf = BytesMut::from(&b"fffffffffffffffff\r\n"[..]);
        assert!(matches!(decoder.feed(&mut buf), Err(Error::BadChunk(_))));
    }

    #[test]
    fn missing_crlf_after_data_is_rejected() {
        let mut decoder = ChunkedDecoder::new(H1Limits::default());
        let mut buf = BytesMut::from(&b"3\r\nabcXX"[..]);
        assert!(matches!(decoder.feed(&mut buf), Err(Error::BadChunk(_))));
    }

    #[test]
    fn round_trip_across_chunk_sizes() {
        let body: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for chunk_size in [1usize, 7, 64, 999, 1000, 4096] {
            let mut wire = Vec::new();
            for chunk in body.chunks(chunk_size) {
                encode_chunk(chunk, &mut wire);
            }
            encode_terminator(None, &mut wire);
            let (decoded, _) = decode_all(&wire);
            assert_eq!(decoded, body, "chunk_size={chunk_size}");
        }
    }
}
