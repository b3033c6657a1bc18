//! HTTP/2 frame header and payload codecs.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;

/// Frame type octets (RFC 9113 §6).
pub mod kind {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

/// Frame flag bits.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// Setting identifiers.
pub mod setting {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// Protocol error codes (RFC 9113 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    Unknown(u32),
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::NoError => 0x0,
            ErrorCode::ProtocolError => 0x1,
            ErrorCode::InternalError => 0x2,
            ErrorCode::FlowControlError => 0x3,
            ErrorCode::SettingsTimeout => 0x4,
            ErrorCode::StreamClosed => 0x5,
            ErrorCode::FrameSizeError => 0x6,
            ErrorCode::RefusedStream => 0x7,
            ErrorCode::Cancel => 0x8,
            ErrorCode::CompressionError => 0x9,
            ErrorCode::ConnectError => 0xa,
            ErrorCode::EnhanceYourCalm => 0xb,
            ErrorCode::InadequateSecurity => 0xc,
            ErrorCode::Http11Required => 0xd,
            ErrorCode::Unknown(other) => other,
        }
    }
}

/// The fixed 9-byte frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 9;

    /// Parses a header from the first 9 buffered bytes, if present.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let length = (u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2]);
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
        Some(FrameHeader {
            length,
            kind: buf[3],
            flags: buf[4],
            stream_id,
        })
    }

    pub fn encode<B: BufMut>(&self, out: &mut B) {
        out.put_u8((self.length >> 16) as u8);
        out.put_u8((self.length >> 8) as u8);
        out.put_u8(self.length as u8);
        out.put_u8(self.kind);
        out.put_u8(self.flags);
        out.put_u32(self.stream_id & 0x7fff_ffff);
    }

    #[inline]
    #[must_use]
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// A parsed frame, padding and priority fields already stripped.
#[derive(Debug, Clone)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Wire length including padding, for flow-control accounting.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
        end_stream: bool,
    },
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        code: ErrorCode,
    },
    Settings {
        ack: bool,
        values: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    /// Unknown frame types are ignored by the engine.
    Unknown {
        kind: u8,
    },
}

impl Frame {
    /// Parses one frame payload according to its header.
    ///
    /// Errors carry the connection error code the engine must emit.
    pub fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Frame, (ErrorCode, String)> {
        match header.kind {
            kind::DATA => {
                if header.stream_id == 0 {
                    return Err((ErrorCode::ProtocolError, "DATA on stream 0".into()));
                }
                let flow_len = header.length;
                let data = strip_padding(header, payload)?;
                Ok(Frame::Data {
                    stream_id: header.stream_id,
                    data,
                    end_stream: header.has(flags::END_STREAM),
                    flow_len,
                })
            }
            kind::HEADERS => {
                if header.stream_id == 0 {
                    return Err((ErrorCode::ProtocolError, "HEADERS on stream 0".into()));
                }
                let mut block = strip_padding(header, payload)?;
                if header.has(flags::PRIORITY) {
                    if block.len() < 5 {
                        return Err((ErrorCode::FrameSizeError, "HEADERS priority fields short".into()));
                    }
                    block.advance(5);
                }
                Ok(Frame::Headers {
                    stream_id: header.stream_id,
                    block,
                    end_headers: header.has(flags::END_HEADERS),
                    end_stream: header.has(flags::END_STREAM),
                })
            }
            kind::PRIORITY => {
                if header.stream_id == 0 {
                    return Err((ErrorCode::ProtocolError, "PRIORITY on stream 0".into()));
                }
                if payload.len() != 5 {
                    return Err((ErrorCode::FrameSizeError, "PRIORITY length".into()));
                }
                Ok(Frame::Priority { stream_id: header.stream_id })
            }
            kind::RST_STREAM => {
                if header.stream_id == 0 {
                    return Err((ErrorCode::ProtocolError, "RST_STREAM on stream 0".into()));
                }
                if payload.len() != 4 {
                    return Err((ErrorCode::FrameSizeError, "RST_STREAM length".into()));
                }
                Ok(Frame::RstStream {
                    stream_id: header.stream_id,
                    code: ErrorCode::from(payload.get_u32()),
                })
            }
            kind::SETTINGS => {
                if header.stream_id != 0 {
                    return Err((ErrorCode::ProtocolError, "SETTINGS on a stream".into()));
                }
                let ack = header.has(flags::ACK);
                if ack {
                    if !payload.is_empty() {
                        return Err((ErrorCode::FrameSizeError, "SETTINGS ack with payload".into()));
                    }
                    return Ok(Frame::Settings { ack: true, values: Vec::new() });
                }
                if payload.len() % 6 != 0 {
                    return Err((ErrorCode::FrameSizeError, "SETTINGS length".into()));
                }
                let mut values = Vec::with_capacity(payload.len() / 6);
                while payload.has_remaining() {
                    values.push((payload.get_u16(), payload.get_u32()));
                }
                Ok(Frame::Settings { ack: false, values })
            }
            kind::PUSH_PROMISE => {
                if header.stream_id == 0 {
                    return Err((ErrorCode::ProtocolError, "PUSH_PROMISE on stream 0".into()));
                }
                let mut block = strip_padding(header, payload)?;
                if block.len() < 4 {
                    return Err((ErrorCode::FrameSizeError, "PUSH_PROMISE short".into()));
                }
                let promised_id = block.get_u32() & 0x7fff_ffff;
                Ok(Frame::PushPromise {
                    stream_id: header.stream_id,
                    promised_id,
                    block,
                    end_headers: header.has(flags::END_HEADERS),
                })
            }
            kind::PING => {
                if header.stream_id != 0 {
                    return Err((ErrorCode::ProtocolError, "PING on a stream".into()));
                }
                if payload.len() != 8 {
                    return Err((ErrorCode::FrameSizeError, "PING length".into()));
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Ok(Frame::Ping { ack: header.has(flags::ACK), payload: data })
            }
            kind::GOAWAY => {
                if header.stream_id != 0 {
                    return Err((ErrorCode::ProtocolError, "GOAWAY on a stream".into()));
                }
                if payload.len() < 8 {
                    return Err((ErrorCode::FrameSizeError, "GOAWAY short".into()));
                }
                let last_stream_id = payload.get_u32() & 0x7fff_ffff;
                let code = ErrorCode::from(payload.get_u32());
                Ok(Frame::GoAway { last_stream_id, code, debug: payload })
            }
            kind::WINDOW_UPDATE => {
                if payload.len() != 4 {
                    return Err((ErrorCode::FrameSizeError, "WINDOW_UPDATE length".into()));
                }
                let increment = payload.get_u32() & 0x7fff_ffff;
                Ok(Frame::WindowUpdate { stream_id: header.stream_id, increment })
            }
            kind::CONTINUATION => {
                if header.stream_id == 0 {
                    return Err((ErrorCode::ProtocolError, "CONTINUATION on stream 0".into()));
                }
                Ok(Frame::Continuation {
                    stream_id: header.stream_id,
                    block: payload,
                    end_headers: header.has(flags::END_HEADERS),
                })
            }
            other => Ok(Frame::Unknown { kind: other }),
        }
    }
}

/// Removes the pad-length octet and trailing padding when PADDED.
fn strip_padding(header: &FrameHeader, mut payload: Bytes) -> Result<Bytes, (ErrorCode, String)> {
    if !header.has(flags::PADDED) {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err((ErrorCode::FrameSizeError, "padded frame without pad length".into()));
    }
    let pad = usize::from(payload.get_u8());
    if pad >= payload.len() + 1 {
        // Pad length must be strictly less than the remaining payload
        // plus its own octet.
        return Err((ErrorCode::ProtocolError, "padding exceeds payload".into()));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

/// Frame builders used by the engine.
pub mod build {
    use super::*;

    pub fn data(stream_id: u32, data: &[u8], end_stream: bool, out: &mut Vec<u8>) {
        FrameHeader {
            length: data.len() as u32,
            kind: kind::DATA,
            flags: if end_stream { flags::END_STREAM } else { 0 },
            stream_id,
        }
        .encode(out);
        out.extend_from_slice(data);
    }

    /// HEADERS plus CONTINUATIONs, splitting `block` at `max_frame`.
    pub fn headers(
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
        max_frame: usize,
        out: &mut Vec<u8>,
    ) {
        let mut chunks = block.chunks(max_frame.max(1));
        let first = chunks.next().unwrap_or(&[]);
        let rest: Vec<&[u8]> = chunks.collect();

        let mut first_flags = if end_stream { flags::END_STREAM } else { 0 };
        if rest.is_empty() {
            first_flags |= flags::END_HEADERS;
        }
        FrameHeader {
            length: first.len() as u32,
            kind: kind::HEADERS,
            flags: first_flags,
            stream_id,
        }
        .encode(out);
        out.extend_from_slice(first);

        for (i, chunk) in rest.iter().enumerate() {
            let last = i == rest.len() - 1;
            FrameHeader {
                length: chunk.len() as u32,
                kind: kind::CONTINUATION,
                flags: if last { flags::END_HEADERS } else { 0 },
                stream_id,
            }
            .encode(out);
            out.extend_from_slice(chunk);
        }
    }

    pub fn rst_stream(stream_id: u32, code: ErrorCode, out: &mut Vec<u8>) {
        FrameHeader { length: 4, kind: kind::RST_STREAM, flags: 0, stream_id }.encode(out);
        out.extend_from_slice(&u32::from(code).to_be_bytes());
    }

    pub fn settings(values: &[(u16, u32)], out: &mut Vec<u8>) {
        FrameHeader {
            length: (values.len() * 6) as u32,
            kind: kind::SETTINGS,
            flags: 0,
            stream_id: 0,
        }
        .encode(out);
        for (id, value) in values {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        }
    }

    pub fn settings_ack(out: &mut Vec<u8>) {
        FrameHeader { length: 0, kind: kind::SETTINGS, flags: flags::ACK, stream_id: 0 }.encode(out);
    }

    pub fn ping(payload: [u8; 8], ack: bool, out: &mut Vec<u8>) {
        FrameHeader {
            length: 8,
            kind: kind::PING,
            flags: if ack { flags::ACK } else { 0 },
            stream_id: 0,
        }
        .encode(out);
        out.extend_from_slice(&payload);
    }

    pub fn goaway(last_stream_id: u32, code: ErrorCode, out: &mut Vec<u8>) {
        FrameHeader { length: 8, kind: kind::GOAWAY, flags: 0, stream_id: 0 }.encode(out);
        out.extend_from_slice(&(last_stream_id & 0x7fff_ffff).to_be_bytes());
        out.extend_from_slice(&u32::from(code).to_be_bytes());
    }

    pub fn window_update(stream_id: u32, increment: u32, out: &mut Vec<u8>) {
        FrameHeader { length: 4, kind: kind::WINDOW_UPDATE, flags: 0, stream_id }.encode(out);
        out.extend_from_slice(&(increment & 0x7fff_ffff).to_be_bytes());
    }
}

/// Typed SETTINGS values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            header_table_size: 4096,
            enable_push: false,
            max_concurrent_streams: None,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_header_list_size: None,
        }
    }
}

impl Settings {
    /// Applies received values, validating each per RFC 9113 §6.5.2.
    pub fn apply(&mut self, values: &[(u16, u32)]) -> Result<(), (ErrorCode, String)> {
        for &(id, value) in values {
            match id {
                setting::HEADER_TABLE_SIZE => self.header_table_size = value,
                setting::ENABLE_PUSH => match value {
                    0 => self.enable_push = false,
                    1 => self.enable_push = true,
                    _ => return Err((ErrorCode::ProtocolError, "ENABLE_PUSH not 0/1".into())),
                },
                setting::MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
                setting::INITIAL_WINDOW_SIZE => {
                    if value > 0x7fff_ffff {
                        return Err((ErrorCode::FlowControlError, "INITIAL_WINDOW_SIZE too large".into()));
                    }
                    self.initial_window_size = value;
                }
                setting::MAX_FRAME_SIZE => {
                    if !(16_384..=16_777_215).contains(&value) {
                        return Err((ErrorCode::ProtocolError, "MAX_FRAME_SIZE out of range".into()));
                    }
                    self.max_frame_size = value;
                }
                setting::MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
                // Unknown identifiers must be ignored.
                _ => {}
            }
        }
        Ok(())
    }

    /// Values worth sending for this configuration.
    #[must_use]
    pub fn to_values(&self) -> Vec<(u16, u32)> {
        let mut values = vec![
            (setting::HEADER_TABLE_SIZE, self.header_table_size),
            (setting::ENABLE_PUSH, u32::from(self.enable_push)),
            (setting::INITIAL_WINDOW_SIZE, self.initial_window_size),
            (setting::MAX_FRAME_SIZE, self.max_frame_size),
        ];
        if let Some(max) = self.max_concurrent_streams {
            values.push((setting::MAX_CONCURRENT_STREAMS, max));
        }
        if let Some(max) = self.max_header_list_size {
            values.push((setting::MAX_HEADER_LIST_SIZE, max));
        }
        values
    }
}

/// Buffered frame reader: yields (header, payload) pairs once complete
/// frames are available, enforcing the size cap up front.
pub fn next_frame(
    buf: &mut BytesMut,
    max_frame_size: u32,
) -> Result<Option<(FrameHeader, Bytes)>, (ErrorCode, String)> {
    let Some(header) = FrameHeader::parse(buf) else {
        return Ok(None);
    };
    if header.length > max_frame_size {
        return Err((
            ErrorCode::FrameSizeError,
            format!("frame of {} bytes exceeds {}", header.length, max_frame_size),
        ));
    }
    let total = FrameHeader::SIZE + header.length as usize;
    if buf.len() < total {
        return Ok(None);
    }
    buf.advance(FrameHeader::SIZE);
    let payload = buf.split_to(header.length as usize).freeze();
    Ok(Some((header, payload)))
}

/// Maps a frame-layer error into the engine's public error type.
pub fn to_error(code: ErrorCode, detail: String) -> Error {
    match code {
        ErrorCode::FlowControlError => Error::FlowControlViolation(detail),
        ErrorCode::CompressionError => Error::CompressionError(detail),
        ErrorCode::FrameSizeError => Error::TooLarge(detail),
        _ => Error::UnexpectedFrame(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader { length: 0x01_02_03, kind: kind::DATA, flags: 0x5, stream_id: 77 };
        let mut out = Vec::new();
        header.encode(&mut out);
        assert_eq!(out.len(), FrameHeader::SIZE);
        let parsed = FrameHeader::parse(&out).unwrap();
        assert_eq!(parsed.length, 0x01_02_03);
        assert_eq!(parsed.kind, kind::DATA);
        assert_eq!(parsed.flags, 0x5);
        assert_eq!(parsed.stream_id, 77);
    }

    #[test]
    fn reserved_bit_is_cleared() {
        let mut out = Vec::new();
        FrameHeader { length: 0, kind: kind::PING, flags: 0, stream_id: 0x8000_0001 }.encode(&mut out);
        assert_eq!(FrameHeader::parse(&out).unwrap().stream_id, 1);
    }

    #[test]
    fn padded_data_is_stripped_but_counted() {
        // payload: pad_len 2, "abc", 2 pad bytes.
        let mut wire = Vec::new();
        FrameHeader { length: 6, kind: kind::DATA, flags: flags::PADDED, stream_id: 1 }.encode(&mut wire);
        wire.extend_from_slice(&[2, b'a', b'b', b'c', 0, 0]);

        let mut buf = BytesMut::from(&wire[..]);
        let (header, payload) = next_frame(&mut buf, 16_384).unwrap().unwrap();
        match Frame::parse(&header, payload).unwrap() {
            Frame::Data { data, flow_len, .. } => {
                assert_eq!(&data[..], b"abc");
                assert_eq!(flow_len, 6);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn padding_covering_whole_payload_is_rejected() {
        let mut wire = Vec::new();
        FrameHeader { length: 4, kind: kind::DATA, flags: flags::PADDED, stream_id: 1 }.encode(&mut wire);
        wire.extend_from_slice(&[4, 0, 0, 0]);
        let mut buf = BytesMut::from(&wire[..]);
        let (header, payload) = next_frame(&mut buf, 16_384).unwrap().unwrap();
        assert!(Frame::parse(&header, payload).is_err());
    }

    #[test]
    fn oversized_frame_is_refused_before_buffering() {
        let mut wire = Vec::new();
        FrameHeader { length: 20_000, kind: kind::DATA, flags: 0, stream_id: 1 }.encode(&mut wire);
        let mut buf = BytesMut::from(&wire[..]);
        let err = next_frame(&mut buf, 16_384).unwrap_err();
        assert_eq!(err.0, ErrorCode::FrameSizeError);
    }

    #[test]
    fn headers_split_into_continuations() {
        let block = vec![0xaa; 100];
        let mut out = Vec::new();
        build::headers(5, &block, true, 40, &mut out);

        let mut buf = BytesMut::from(&out[..]);
        let (h1, _) = next_frame(&mut buf, 16_384).unwrap().unwrap();
        assert_eq!(h1.kind, kind::HEADERS);
        assert!(h1.has(flags::END_STREAM));
        assert!(!h1.has(flags::END_HEADERS));
        let (h2, _) = next_frame(&mut buf, 16_384).unwrap().unwrap();
        assert_eq!(h2.kind, kind::CONTINUATION);
        assert!(!h2.has(flags::END_HEADERS));
        let (h3, _) = next_frame(&mut buf, 16_384).unwrap().unwrap();
        assert_eq!(h3.kind, kind::CONTINUATION);
        assert!(h3.has(flags::END_HEADERS));
    }

    #[test]
    fn settings_validation() {
        let mut settings = Settings::default();
        settings.apply(&[(setting::INITIAL_WINDOW_SIZE, 1 << 20)]).unwrap();
        assert_eq!(settings.initial_window_size, 1 << 20);

        assert!(settings.apply(&[(setting::INITIAL_WINDOW_SIZE, 1 << 31)]).is_err());
        assert!(settings.apply(&[(setting::MAX_FRAME_SIZE, 100)]).is_err());
        assert!(settings.apply(&[(setting::ENABLE_PUSH, 2)]).is_err());
        // Unknown settings are ignored.
        settings.apply(&[(0xff, 1)]).unwrap();
    }
}
