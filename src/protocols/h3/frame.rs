//! HTTP/3 frame codec.
//!
//! Frames are `type varint, length varint, payload`. DATA payloads are
//! streamed through without buffering; every other frame is collected
//! whole before it is surfaced.

use bytes::{Buf, Bytes, BytesMut};

use crate::protocols::wire::VarInt;

/// Frame type codes (RFC 9114 §7.2).
pub mod kind {
    pub const DATA: u64 = 0x0;
    pub const HEADERS: u64 = 0x1;
    pub const CANCEL_PUSH: u64 = 0x3;
    pub const SETTINGS: u64 = 0x4;
    pub const PUSH_PROMISE: u64 = 0x5;
    pub const GOAWAY: u64 = 0x7;
    pub const MAX_PUSH_ID: u64 = 0xd;
}

/// Frame types carried over from HTTP/2 that must not appear here.
const RESERVED_H2_FRAMES: [u64; 4] = [0x2, 0x6, 0x8, 0x9];

/// SETTINGS identifiers (RFC 9114 §7.2.4.1, RFC 9204 §5).
pub mod setting {
    pub const QPACK_MAX_TABLE_CAPACITY: u64 = 0x1;
    pub const MAX_FIELD_SECTION_SIZE: u64 = 0x6;
    pub const QPACK_BLOCKED_STREAMS: u64 = 0x7;
}

/// SETTINGS identifiers reserved because they were HTTP/2 settings.
const RESERVED_H2_SETTINGS: [u64; 5] = [0x2, 0x3, 0x4, 0x5, 0x0];

/// HTTP/3 and QPACK error codes (RFC 9114 §8.1, RFC 9204 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    GeneralProtocolError,
    InternalError,
    StreamCreationError,
    ClosedCriticalStream,
    FrameUnexpected,
    FrameError,
    ExcessiveLoad,
    IdError,
    SettingsError,
    MissingSettings,
    RequestRejected,
    RequestCancelled,
    RequestIncomplete,
    MessageError,
    ConnectError,
    VersionFallback,
    QpackDecompressionFailed,
    QpackEncoderStreamError,
    QpackDecoderStreamError,
    Unknown(u64),
}

impl From<ErrorCode> for u64 {
    fn from(code: ErrorCode) -> u64 {
        match code {
            ErrorCode::NoError => 0x100,
            ErrorCode::GeneralProtocolError => 0x101,
            ErrorCode::InternalError => 0x102,
            ErrorCode::StreamCreationError => 0x103,
            ErrorCode::ClosedCriticalStream => 0x104,
            ErrorCode::FrameUnexpected => 0x105,
            ErrorCode::FrameError => 0x106,
            ErrorCode::ExcessiveLoad => 0x107,
            ErrorCode::IdError => 0x108,
            ErrorCode::SettingsError => 0x109,
            ErrorCode::MissingSettings => 0x10a,
            ErrorCode::RequestRejected => 0x10b,
            ErrorCode::RequestCancelled => 0x10c,
            ErrorCode::RequestIncomplete => 0x10d,
            ErrorCode::MessageError => 0x10e,
            ErrorCode::ConnectError => 0x10f,
            ErrorCode::VersionFallback => 0x110,
            ErrorCode::QpackDecompressionFailed => 0x200,
            ErrorCode::QpackEncoderStreamError => 0x201,
            ErrorCode::QpackDecoderStreamError => 0x202,
            ErrorCode::Unknown(code) => code,
        }
    }
}

impl From<u64> for ErrorCode {
    fn from(code: u64) -> ErrorCode {
        match code {
            0x100 => ErrorCode::NoError,
            0x101 => ErrorCode::GeneralProtocolError,
            0x102 => ErrorCode::InternalError,
            0x103 => ErrorCode::StreamCreationError,
            0x104 => ErrorCode::ClosedCriticalStream,
            0x105 => ErrorCode::FrameUnexpected,
            0x106 => ErrorCode::FrameError,
            0x107 => ErrorCode::ExcessiveLoad,
            0x108 => ErrorCode::IdError,
            0x109 => ErrorCode::SettingsError,
            0x10a => ErrorCode::MissingSettings,
            0x10b => ErrorCode::RequestRejected,
            0x10c => ErrorCode::RequestCancelled,
            0x10d => ErrorCode::RequestIncomplete,
            0x10e => ErrorCode::MessageError,
            0x10f => ErrorCode::ConnectError,
            0x110 => ErrorCode::VersionFallback,
            0x200 => ErrorCode::QpackDecompressionFailed,
            0x201 => ErrorCode::QpackEncoderStreamError,
            0x202 => ErrorCode::QpackDecoderStreamError,
            other => ErrorCode::Unknown(other),
        }
    }
}

/// One parsed frame event out of [`FrameReader`].
#[derive(Debug)]
pub enum FrameEvent {
    /// A chunk of DATA payload; `last` marks the frame's final chunk.
    Data { chunk: Bytes, last: bool },
    Headers(Bytes),
    Settings(Vec<(u64, u64)>),
    CancelPush(u64),
    PushPromise,
    GoAway(u64),
    MaxPushId(u64),
    /// An unknown frame type was skipped entirely.
    Skipped,
}

#[derive(Debug)]
enum ReaderState {
    /// Between frames.
    Idle,
    /// Inside a DATA payload.
    Data { remaining: u64 },
    /// Collecting a non-DATA payload.
    Collect { kind: u64, remaining: u64, payload: BytesMut },
    /// Discarding an unknown frame's payload.
    Skip { remaining: u64 },
}

/// Incremental per-stream frame reader.
#[derive(Debug)]
pub struct FrameReader {
    state: ReaderState,
    /// Non-DATA frames larger than this are refused.
    max_collect: u64,
}

impl FrameReader {
    #[must_use]
    pub fn new(max_collect: u64) -> Self {
        FrameReader { state: ReaderState::Idle, max_collect }
    }

    /// True when no frame is partially read (a clean stream end).
    #[must_use]
    pub fn at_boundary(&self) -> bool {
        matches!(self.state, ReaderState::Idle)
    }

    /// Pulls the next event out of `buf`, or `None` for more input.
    pub fn next_event(&mut self, buf: &mut BytesMut) -> Result<Option<FrameEvent>, (ErrorCode, String)> {
        loop {
            match &mut self.state {
                ReaderState::Idle => {
                    // Both varints must be fully present before we
                    // commit to the frame.
                    let mut probe = &buf[..];
                    let Some(kind) = decode_varint(&mut probe)? else {
                        return Ok(None);
                    };
                    let Some(length) = decode_varint(&mut probe)? else {
                        return Ok(None);
                    };
                    let header_len = buf.len() - probe.len();
                    buf.advance(header_len);

                    if RESERVED_H2_FRAMES.contains(&kind) {
                        return Err((
                            ErrorCode::FrameUnexpected,
                            format!("reserved frame type {kind:#x}"),
                        ));
                    }

                    match kind {
                        kind::DATA => {
                            if length == 0 {
                                return Ok(Some(FrameEvent::Data { chunk: Bytes::new(), last: true }));
                            }
                            self.state = ReaderState::Data { remaining: length };
                        }
                        kind::HEADERS
                        | kind::SETTINGS
                        | kind::CANCEL_PUSH
                        | kind::PUSH_PROMISE
                        | kind::GOAWAY
                        | kind::MAX_PUSH_ID => {
                            if length > self.max_collect {
                                return Err((
                                    ErrorCode::ExcessiveLoad,
                                    format!("frame of {length} bytes exceeds limit"),
                                ));
                            }
                            self.state = ReaderState::Collect {
                                kind,
                                remaining: length,
                                payload: BytesMut::with_capacity(length as usize),
                            };
                        }
                        _ => {
                            // Unknown types are skipped, greased or
                            // otherwise.
                            if length == 0 {
                                return Ok(Some(FrameEvent::Skipped));
                            }
                            self.state = ReaderState::Skip { remaining: length };
                        }
                    }
                }
                ReaderState::Data { remaining } => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = usize::try_from((*remaining).min(buf.len() as u64))
                        .expect("bounded by buf.len()");
                    *remaining -= take as u64;
                    let last = *remaining == 0;
                    let chunk = buf.split_to(take).freeze();
                    if last {
                        self.state = ReaderState::Idle;
                    }
                    return Ok(Some(FrameEvent::Data { chunk, last }));
                }
                ReaderState::Collect { kind, remaining, payload } => {
                    let take = usize::try_from((*remaining).min(buf.len() as u64))
                        .expect("bounded by buf.len()");
                    payload.extend_from_slice(&buf.split_to(take));
                    *remaining -= take as u64;
                    if *remaining > 0 {
                        return Ok(None);
                    }
                    let kind = *kind;
                    let payload = std::mem::take(payload).freeze();
                    self.state = ReaderState::Idle;
                    return Ok(Some(finish_frame(kind, payload)?));
                }
                ReaderState::Skip { remaining } => {
                    let take = usize::try_from((*remaining).min(buf.len() as u64))
                        .expect("bounded by buf.len()");
                    buf.advance(take);
                    *remaining -= take as u64;
                    if *remaining > 0 {
                        return Ok(None);
                    }
                    self.state = ReaderState::Idle;
                    return Ok(Some(FrameEvent::Skipped));
                }
            }
        }
    }
}

fn decode_varint(buf: &mut &[u8]) -> Result<Option<u64>, (ErrorCode, String)> {
    VarInt::decode(buf)
        .map(|v| v.map(VarInt::value))
        .map_err(|e| (ErrorCode::FrameError, e.to_string()))
}

fn finish_frame(kind: u64, mut payload: Bytes) -> Result<FrameEvent, (ErrorCode, String)> {
    match kind {
        kind::HEADERS => Ok(FrameEvent::Headers(payload)),
        kind::SETTINGS => {
            let mut values = Vec::new();
            while payload.has_remaining() {
                let id = VarInt::decode_exact(&mut payload)
                    .map_err(|_| (ErrorCode::FrameError, "truncated SETTINGS id".into()))?;
                let value = VarInt::decode_exact(&mut payload)
                    .map_err(|_| (ErrorCode::FrameError, "truncated SETTINGS value".into()))?;
                if RESERVED_H2_SETTINGS.contains(&id.value()) {
                    return Err((
                        ErrorCode::SettingsError,
                        format!("reserved setting {:#x}", id.value()),
                    ));
                }
                values.push((id.value(), value.value()));
            }
            Ok(FrameEvent::Settings(values))
        }
        kind::CANCEL_PUSH => {
            let id = VarInt::decode_exact(&mut payload)
                .map_err(|_| (ErrorCode::FrameError, "truncated CANCEL_PUSH".into()))?;
            if payload.has_remaining() {
                return Err((ErrorCode::FrameError, "CANCEL_PUSH trailing bytes".into()));
            }
            Ok(FrameEvent::CancelPush(id.value()))
        }
        kind::PUSH_PROMISE => Ok(FrameEvent::PushPromise),
        kind::GOAWAY => {
            let id = VarInt::decode_exact(&mut payload)
                .map_err(|_| (ErrorCode::FrameError, "truncated GOAWAY".into()))?;
            if payload.has_remaining() {
                return Err((ErrorCode::FrameError, "GOAWAY trailing bytes".into()));
            }
            Ok(FrameEvent::GoAway(id.value()))
        }
        kind::MAX_PUSH_ID => {
            let id = VarInt::decode_exact(&mut payload)
                .map_err(|_| (ErrorCode::FrameError, "truncated MAX_PUSH_ID".into()))?;
            if payload.has_remaining() {
                return Err((ErrorCode::FrameError, "MAX_PUSH_ID trailing bytes".into()));
            }
            Ok(FrameEvent::MaxPushId(id.value()))
        }
        _ => unreachable!("collected frame kinds are exhaustive"),
    }
}

/// Frame writers.
pub mod build {
    use super::*;

    fn frame_header(kind: u64, length: u64, out: &mut Vec<u8>) {
        VarInt::new(kind).expect("frame types fit").encode(out);
        VarInt::new(length).expect("frame lengths fit").encode(out);
    }

    pub fn data(payload: &[u8], out: &mut Vec<u8>) {
        frame_header(kind::DATA, payload.len() as u64, out);
        out.extend_from_slice(payload);
    }

    pub fn headers(block: &[u8], out: &mut Vec<u8>) {
        frame_header(kind::HEADERS, block.len() as u64, out);
        out.extend_from_slice(block);
    }

    /// SETTINGS with the length computed from the encoded pairs, not
    /// estimated.
    pub fn settings(values: &[(u64, u64)], out: &mut Vec<u8>) {
        let mut payload = Vec::new();
        for &(id, value) in values {
            VarInt::new(id).expect("setting ids fit").encode(&mut payload);
            VarInt::new(value).expect("setting values fit").encode(&mut payload);
        }
        frame_header(kind::SETTINGS, payload.len() as u64, out);
        out.extend_from_slice(&payload);
    }

    pub fn goaway(id: u64, out: &mut Vec<u8>) {
        let mut payload = Vec::new();
        VarInt::new(id).expect("stream ids fit").encode(&mut payload);
        frame_header(kind::GOAWAY, payload.len() as u64, out);
        out.extend_from_slice(&payload);
    }
}
