//! The HTTP/3 connection engine.
//!
//! Flow control and stream delivery belong to the QUIC collaborator;
//! this engine routes per-stream bytes: request streams through the
//! frame reader and QPACK, the peer's control stream through SETTINGS
//! and GOAWAY handling, and the QPACK encoder/decoder streams into the
//! header codec. Output is drained per stream via
//! [`H3Connection::poll_transmit`].

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::config::H3Config;
use crate::error::Error;
use crate::http::{FieldSection, Request, Response};
use crate::protocols::message::{self, PeerHead};
use crate::protocols::qpack;
use crate::protocols::wire::VarInt;

use super::frame::{self, build, ErrorCode, FrameEvent, FrameReader};
use super::stream_type;

/// Largest non-DATA frame the engine will buffer.
const MAX_FRAME_COLLECT: u64 = 256 * 1024;

/// Events surfaced by [`H3Connection`].
#[derive(Debug)]
pub enum Event {
    /// The peer's SETTINGS arrived on its control stream.
    PeerSettings { qpack_max_table_capacity: u64, qpack_blocked_streams: u64, max_field_section_size: u64 },
    /// A request or response head arrived on `stream_id`.
    Headers {
        stream_id: u64,
        head: PeerHead,
        /// No body follows (FIN already consumed).
        fin: bool,
    },
    /// Body bytes arrived.
    Data { stream_id: u64, data: Bytes },
    /// Trailers arrived.
    Trailers { stream_id: u64, trailers: FieldSection },
    /// The peer finished the stream cleanly.
    Finished { stream_id: u64 },
    /// The peer is draining; streams at or above `id` were not and
    /// will not be processed.
    GoAway { id: u64 },
    /// A request stream failed without killing the connection.
    StreamError { stream_id: u64, code: ErrorCode },
}

/// Outgoing bytes for one QUIC stream.
#[derive(Debug)]
pub struct Transmit {
    pub stream_id: u64,
    pub data: Vec<u8>,
    pub fin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// Peer uni-stream routing decided by its type varint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UniKind {
    Control,
    QpackEncoder,
    QpackDecoder,
    /// Unknown types are drained and discarded.
    Discard,
}

/// Read and write closure are tracked independently, like the two
/// half-closed states of an HTTP/2 stream: a request whose read side
/// finished still needs its bookkeeping until the response side has
/// queued its FIN.
#[derive(Debug)]
struct RequestStream {
    reader: FrameReader,
    buf: BytesMut,
    /// Final head seen (interim responses do not count).
    head_seen: bool,
    /// Trailing HEADERS seen; only FIN may follow.
    trailers_seen: bool,
    /// FIN arrived from the transport.
    fin_received: bool,
    /// Bytes stay queued in `buf` while the head section is
    /// QPACK-blocked.
    blocked: bool,
    /// Our final head went out; a second one is refused.
    head_sent: bool,
    /// Peer FIN consumed and every frame parsed.
    read_done: bool,
    /// Our FIN queued; no further sends are accepted.
    write_done: bool,
}

impl RequestStream {
    fn new() -> Self {
        RequestStream {
            reader: FrameReader::new(MAX_FRAME_COLLECT),
            buf: BytesMut::new(),
            head_seen: false,
            trailers_seen: false,
            fin_received: false,
            blocked: false,
            head_sent: false,
            read_done: false,
            write_done: false,
        }
    }
}

#[derive(Debug, Default)]
struct Outgoing {
    data: Vec<u8>,
    fin: bool,
}

/// One HTTP/3 connection, either role.
#[derive(Debug)]
pub struct H3Connection {
    role: Role,
    config: H3Config,

    qpack_enc: qpack::Encoder,
    qpack_dec: qpack::Decoder,

    local_control: Option<u64>,
    local_encoder: Option<u64>,
    local_decoder: Option<u64>,

    peer_uni: HashMap<u64, UniKind>,
    peer_control: Option<u64>,
    peer_encoder: Option<u64>,
    peer_decoder: Option<u64>,
    /// Uni streams whose type varint has not fully arrived.
    uni_pending: HashMap<u64, BytesMut>,

    control_reader: FrameReader,
    control_buf: BytesMut,
    peer_settings_seen: bool,

    requests: HashMap<u64, RequestStream>,
    outgoing: HashMap<u64, Outgoing>,
    next_request_id: u64,
    /// Highest peer-initiated request stream accepted (server role).
    largest_peer_request: Option<u64>,

    goaway_sent: Option<u64>,
    goaway_received: Option<u64>,
    fatal: Option<(ErrorCode, Error)>,
}

impl H3Connection {
    #[must_use]
    pub fn new_client(config: &H3Config) -> Self {
        Self::new(Role::Client, config)
    }

    #[must_use]
    pub fn new_server(config: &H3Config) -> Self {
        Self::new(Role::Server, config)
    }

    fn new(role: Role, config: &H3Config) -> Self {
        H3Connection {
            role,
            config: config.clone(),
            // The encoder's bounds arrive with the peer's SETTINGS;
            // until then it stays static-table-only.
            qpack_enc: qpack::Encoder::new(0, 0),
            qpack_dec: qpack::Decoder::new(
                config.qpack_max_table_capacity as usize,
                config.max_field_section_size as usize,
                config.qpack_blocked_streams,
            ),
            local_control: None,
            local_encoder: None,
            local_decoder: None,
            peer_uni: HashMap::new(),
            peer_control: None,
            peer_encoder: None,
            peer_decoder: None,
            uni_pending: HashMap::new(),
            control_reader: FrameReader::new(MAX_FRAME_COLLECT),
            control_buf: BytesMut::new(),
            peer_settings_seen: false,
            requests: HashMap::new(),
            outgoing: HashMap::new(),
            next_request_id: if role == Role::Client { 0 } else { 1 },
            largest_peer_request: None,
            goaway_sent: None,
            goaway_received: None,
            fatal: None,
        }
    }

    /// Registers the three local unidirectional streams the caller
    /// opened on the QUIC connection, and queues each stream's type
    /// byte plus our SETTINGS on the control stream.
    pub fn set_local_uni_streams(&mut self, control: u64, encoder: u64, decoder: u64) {
        self.local_control = Some(control);
        self.local_encoder = Some(encoder);
        self.local_decoder = Some(decoder);

        let out = self.outgoing.entry(control).or_default();
        VarInt::new(stream_type::CONTROL).expect("small").encode(&mut out.data);
        build::settings(
            &[
                (frame::setting::QPACK_MAX_TABLE_CAPACITY, self.config.qpack_max_table_capacity),
                (frame::setting::MAX_FIELD_SECTION_SIZE, self.config.max_field_section_size),
                (frame::setting::QPACK_BLOCKED_STREAMS, self.config.qpack_blocked_streams),
            ],
            &mut out.data,
        );

        let out = self.outgoing.entry(encoder).or_default();
        VarInt::new(stream_type::QPACK_ENCODER).expect("small").encode(&mut out.data);
        let out = self.outgoing.entry(decoder).or_default();
        VarInt::new(stream_type::QPACK_DECODER).expect("small").encode(&mut out.data);
    }

    /// True while the connection accepts new local requests.
    #[must_use]
    pub fn can_open_stream(&self) -> bool {
        self.fatal.is_none() && self.goaway_received.is_none() && self.goaway_sent.is_none()
    }

    /// The error code to close the QUIC connection with, once a fatal
    /// protocol error has been observed.
    #[must_use]
    pub fn fatal_code(&self) -> Option<ErrorCode> {
        self.fatal.as_ref().map(|(code, _)| *code)
    }

    /// Opens a client request stream, returning its QUIC stream id
    /// (client-initiated bidirectional ids: 0, 4, 8, ...).
    pub fn open_request(&mut self, request: &Request, fin: bool) -> Result<u64, Error> {
        debug_assert_eq!(self.role, Role::Client);
        if let Some((_, error)) = &self.fatal {
            return Err(error.clone());
        }
        if self.goaway_received.is_some() || self.goaway_sent.is_some() {
            return Err(Error::OriginDraining);
        }
        request.validate(true)?;

        let stream_id = self.next_request_id;
        self.next_request_id += 4;

        self.encode_section_to(stream_id, &message::request_fields(request))?;
        if fin {
            self.outgoing.entry(stream_id).or_default().fin = true;
        }
        let mut stream = RequestStream::new();
        stream.write_done = fin;
        self.requests.insert(stream_id, stream);
        tracing::debug!(target: "trireme::h3::conn", stream_id, "request stream opened");
        Ok(stream_id)
    }

    /// Sends a response head on a server request stream.
    pub fn send_response(
        &mut self,
        stream_id: u64,
        response: &Response,
        fin: bool,
    ) -> Result<(), Error> {
        debug_assert_eq!(self.role, Role::Server);
        if let Some((_, error)) = &self.fatal {
            return Err(error.clone());
        }
        let stream = self.requests.get_mut(&stream_id).ok_or(Error::StreamGone)?;
        if stream.write_done {
            return Err(Error::MalformedMessage("response after stream end".into()));
        }
        // Exactly one final response per request; interim heads may
        // precede it.
        if stream.head_sent && !response.status.is_informational() {
            return Err(Error::MalformedMessage("response already sent".into()));
        }
        let final_fin = fin && !response.status.is_informational();
        if !response.status.is_informational() {
            stream.head_sent = true;
        }
        if final_fin {
            stream.write_done = true;
        }
        self.encode_section_to(stream_id, &message::response_fields(response))?;
        if final_fin {
            self.outgoing.entry(stream_id).or_default().fin = true;
            self.maybe_remove(stream_id);
        }
        Ok(())
    }

    /// Queues body bytes as a DATA frame; `fin` closes the stream.
    pub fn send_body(&mut self, stream_id: u64, data: Bytes, fin: bool) -> Result<(), Error> {
        if let Some((_, error)) = &self.fatal {
            return Err(error.clone());
        }
        let stream = self.requests.get_mut(&stream_id).ok_or(Error::StreamGone)?;
        if stream.write_done {
            return Err(Error::MalformedMessage("body after stream end".into()));
        }
        if fin {
            stream.write_done = true;
        }
        let out = self.outgoing.entry(stream_id).or_default();
        if !data.is_empty() {
            build::data(&data, &mut out.data);
        }
        if fin {
            out.fin = true;
            self.maybe_remove(stream_id);
        }
        Ok(())
    }

    /// Queues trailers; the stream ends after them.
    pub fn send_trailers(&mut self, stream_id: u64, trailers: &FieldSection) -> Result<(), Error> {
        if let Some((_, error)) = &self.fatal {
            return Err(error.clone());
        }
        let stream = self.requests.get_mut(&stream_id).ok_or(Error::StreamGone)?;
        if stream.write_done {
            return Err(Error::MalformedMessage("trailers after stream end".into()));
        }
        stream.write_done = true;
        self.encode_section_to(stream_id, &message::trailer_fields(trailers))?;
        self.outgoing.entry(stream_id).or_default().fin = true;
        self.maybe_remove(stream_id);
        Ok(())
    }

    /// Starts draining. The id carried is the next request id we would
    /// accept (server) or have opened (client).
    pub fn go_away(&mut self) {
        if self.goaway_sent.is_some() {
            return;
        }
        let id = match self.role {
            Role::Server => self.largest_peer_request.map_or(0, |id| id + 4),
            Role::Client => self.next_request_id,
        };
        if let Some(control) = self.local_control {
            let out = self.outgoing.entry(control).or_default();
            build::goaway(id, &mut out.data);
        }
        self.goaway_sent = Some(id);
    }

    /// Abandons a request: parked QPACK state is released and the
    /// caller must RESET/STOP_SENDING the QUIC stream with
    /// `ErrorCode::RequestCancelled`.
    pub fn cancel_request(&mut self, stream_id: u64) {
        self.requests.remove(&stream_id);
        self.outgoing.remove(&stream_id);
        self.qpack_dec.cancel_stream(stream_id);
        self.flush_decoder_feedback();
    }

    /// The peer reset a request stream.
    pub fn on_stream_reset(&mut self, stream_id: u64) {
        self.requests.remove(&stream_id);
        self.outgoing.remove(&stream_id);
        self.qpack_dec.cancel_stream(stream_id);
        self.flush_decoder_feedback();
    }

    /// Consumes bytes the QUIC transport delivered for `stream_id`.
    pub fn recv_stream(
        &mut self,
        stream_id: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<Vec<Event>, Error> {
        if let Some((_, error)) = &self.fatal {
            return Err(error.clone());
        }
        // Low two bits encode initiator and directionality; bit 0x2 is
        // set on unidirectional streams.
        if stream_id & 0x2 != 0 {
            self.recv_uni(stream_id, data, fin)
        } else {
            self.recv_request(stream_id, data, fin)
        }
    }

    /// Bytes the engine wants written, per stream.
    pub fn poll_transmit(&mut self) -> Vec<Transmit> {
        let mut out: Vec<Transmit> = self
            .outgoing
            .drain()
            .filter(|(_, buf)| !buf.data.is_empty() || buf.fin)
            .map(|(stream_id, buf)| Transmit { stream_id, data: buf.data, fin: buf.fin })
            .collect();
        // Stable order keeps control data ahead of request data.
        out.sort_by_key(|t| t.stream_id);
        out
    }

    // ===== unidirectional streams =====

    fn recv_uni(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<Vec<Event>, Error> {
        let kind = match self.peer_uni.get(&stream_id) {
            Some(kind) => *kind,
            None => {
                let mut buf = self.uni_pending.remove(&stream_id).unwrap_or_default();
                buf.extend_from_slice(data);
                let mut probe = &buf[..];
                let Some(type_varint) = VarInt::decode(&mut probe)? else {
                    if fin {
                        return Ok(Vec::new());
                    }
                    self.uni_pending.insert(stream_id, buf);
                    return Ok(Vec::new());
                };
                let consumed = buf.len() - probe.len();
                let rest = buf.split_off(consumed);
                let kind = self.classify_uni(stream_id, type_varint.value())?;
                self.peer_uni.insert(stream_id, kind);
                // Re-enter with the remainder of this first burst.
                return self.route_uni(stream_id, kind, &rest, fin);
            }
        };
        self.route_uni(stream_id, kind, data, fin)
    }

    fn classify_uni(&mut self, stream_id: u64, type_code: u64) -> Result<UniKind, Error> {
        let kind = match type_code {
            stream_type::CONTROL => {
                if self.peer_control.is_some() {
                    return Err(self.connection_error(
                        ErrorCode::StreamCreationError,
                        "second control stream".into(),
                    ));
                }
                self.peer_control = Some(stream_id);
                UniKind::Control
            }
            stream_type::QPACK_ENCODER => {
                if self.peer_encoder.is_some() {
                    return Err(self.connection_error(
                        ErrorCode::StreamCreationError,
                        "second qpack encoder stream".into(),
                    ));
                }
                self.peer_encoder = Some(stream_id);
                UniKind::QpackEncoder
            }
            stream_type::QPACK_DECODER => {
                if self.peer_decoder.is_some() {
                    return Err(self.connection_error(
                        ErrorCode::StreamCreationError,
                        "second qpack decoder stream".into(),
                    ));
                }
                self.peer_decoder = Some(stream_id);
                UniKind::QpackDecoder
            }
            stream_type::PUSH => {
                // MAX_PUSH_ID is never sent, so no push stream is
                // legitimate.
                return Err(self.connection_error(ErrorCode::IdError, "unsolicited push stream".into()));
            }
            _ => UniKind::Discard,
        };
        Ok(kind)
    }

    fn route_uni(
        &mut self,
        stream_id: u64,
        kind: UniKind,
        data: &[u8],
        fin: bool,
    ) -> Result<Vec<Event>, Error> {
        if fin && matches!(kind, UniKind::Control | UniKind::QpackEncoder | UniKind::QpackDecoder) {
            return Err(self.connection_error(
                ErrorCode::ClosedCriticalStream,
                format!("critical stream {stream_id} closed"),
            ));
        }
        match kind {
            UniKind::Discard => Ok(Vec::new()),
            UniKind::Control => self.recv_control(data),
            UniKind::QpackEncoder => {
                if let Err(error) = self.qpack_dec.read_encoder_stream(data) {
                    let detail = error.to_string();
                    return Err(self.connection_error(ErrorCode::QpackEncoderStreamError, detail));
                }
                self.flush_decoder_feedback();
                let mut events = Vec::new();
                self.drain_unblocked(&mut events)?;
                Ok(events)
            }
            UniKind::QpackDecoder => {
                if let Err(error) = self.qpack_enc.read_decoder_stream(data) {
                    let detail = error.to_string();
                    return Err(self.connection_error(ErrorCode::QpackDecoderStreamError, detail));
                }
                Ok(Vec::new())
            }
        }
    }

    fn recv_control(&mut self, data: &[u8]) -> Result<Vec<Event>, Error> {
        self.control_buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            let mut buf = std::mem::take(&mut self.control_buf);
            let event = match self.control_reader.next_event(&mut buf) {
                Ok(event) => {
                    self.control_buf = buf;
                    event
                }
                Err((code, detail)) => {
                    self.control_buf = buf;
                    return Err(self.connection_error(code, detail));
                }
            };
            let Some(event) = event else {
                return Ok(events);
            };

            match event {
                FrameEvent::Settings(values) => {
                    if self.peer_settings_seen {
                        return Err(self.connection_error(
                            ErrorCode::FrameUnexpected,
                            "second SETTINGS on control stream".into(),
                        ));
                    }
                    self.peer_settings_seen = true;
                    let mut capacity = 0u64;
                    let mut blocked = 0u64;
                    let mut section = u64::MAX;
                    for (id, value) in &values {
                        match *id {
                            frame::setting::QPACK_MAX_TABLE_CAPACITY => capacity = *value,
                            frame::setting::QPACK_BLOCKED_STREAMS => blocked = *value,
                            frame::setting::MAX_FIELD_SECTION_SIZE => section = *value,
                            _ => {}
                        }
                    }
                    // The encoder adopts the peer's bounds; its table
                    // was untouched until now.
                    self.qpack_enc = qpack::Encoder::new(capacity as usize, blocked);
                    if capacity > 0 {
                        self.qpack_enc.set_peer_capacity(capacity as usize);
                    }
                    events.push(Event::PeerSettings {
                        qpack_max_table_capacity: capacity,
                        qpack_blocked_streams: blocked,
                        max_field_section_size: section,
                    });
                }
                FrameEvent::GoAway(id) => {
                    if !self.peer_settings_seen {
                        return Err(self.connection_error(
                            ErrorCode::MissingSettings,
                            "control stream did not start with SETTINGS".into(),
                        ));
                    }
                    if let Some(previous) = self.goaway_received {
                        if id > previous {
                            return Err(self.connection_error(
                                ErrorCode::IdError,
                                "GOAWAY id increased".into(),
                            ));
                        }
                    }
                    self.goaway_received = Some(id);
                    events.push(Event::GoAway { id });
                    // Local streams the peer will not process.
                    let refused: Vec<u64> = self
                        .requests
                        .keys()
                        .copied()
                        .filter(|&sid| sid & 0x3 == 0 && sid >= id && self.role == Role::Client)
                        .collect();
                    for sid in refused {
                        self.requests.remove(&sid);
                        self.outgoing.remove(&sid);
                        events.push(Event::StreamError {
                            stream_id: sid,
                            code: ErrorCode::RequestRejected,
                        });
                    }
                }
                FrameEvent::CancelPush(_) | FrameEvent::MaxPushId(_) => {
                    if !self.peer_settings_seen {
                        return Err(self.connection_error(
                            ErrorCode::MissingSettings,
                            "control stream did not start with SETTINGS".into(),
                        ));
                    }
                    // Parsed and ignored: push is never enabled.
                }
                FrameEvent::Skipped => {
                    if !self.peer_settings_seen {
                        return Err(self.connection_error(
                            ErrorCode::MissingSettings,
                            "control stream did not start with SETTINGS".into(),
                        ));
                    }
                }
                FrameEvent::Data { .. } | FrameEvent::Headers(_) | FrameEvent::PushPromise => {
                    return Err(self.connection_error(
                        ErrorCode::FrameUnexpected,
                        "request frame on control stream".into(),
                    ));
                }
            }
        }
    }

    // ===== request streams =====

    fn recv_request(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<Vec<Event>, Error> {
        match self.role {
            Role::Client => {
                if stream_id & 0x3 == 1 {
                    return Err(self.connection_error(
                        ErrorCode::StreamCreationError,
                        "server-initiated bidirectional stream".into(),
                    ));
                }
                if !self.requests.contains_key(&stream_id) {
                    // Data for a cancelled/unknown stream is dropped.
                    return Ok(Vec::new());
                }
            }
            Role::Server => {
                if !self.requests.contains_key(&stream_id) {
                    if stream_id & 0x3 != 0 {
                        return Err(self.connection_error(
                            ErrorCode::StreamCreationError,
                            "server-initiated bidi stream from client".into(),
                        ));
                    }
                    if let Some(goaway) = self.goaway_sent {
                        if stream_id >= goaway {
                            // Refused while draining.
                            return Ok(vec![Event::StreamError {
                                stream_id,
                                code: ErrorCode::RequestRejected,
                            }]);
                        }
                    }
                    self.largest_peer_request =
                        Some(self.largest_peer_request.map_or(stream_id, |l| l.max(stream_id)));
                    self.requests.insert(stream_id, RequestStream::new());
                }
            }
        }

        let mut events = Vec::new();
        {
            let stream = self
                .requests
                .get_mut(&stream_id)
                .unwrap_or_else(|| unreachable!("ensured above"));
            stream.buf.extend_from_slice(data);
            if fin {
                stream.fin_received = true;
            }
        }
        self.process_request_stream(stream_id, &mut events)?;
        Ok(events)
    }

    fn process_request_stream(&mut self, stream_id: u64, events: &mut Vec<Event>) -> Result<(), Error> {
        loop {
            let Some(stream) = self.requests.get_mut(&stream_id) else {
                return Ok(());
            };
            if stream.blocked {
                // Everything stays buffered until QPACK unblocks.
                return Ok(());
            }

            let mut buf = std::mem::take(&mut stream.buf);
            let result = stream.reader.next_event(&mut buf);
            let event = match result {
                Ok(event) => {
                    if let Some(stream) = self.requests.get_mut(&stream_id) {
                        stream.buf = buf;
                    }
                    event
                }
                Err((code, detail)) => {
                    return Err(self.connection_error(code, detail));
                }
            };

            let Some(event) = event else {
                // Out of frames; a clean FIN finishes the exchange.
                let stream = self
                    .requests
                    .get_mut(&stream_id)
                    .unwrap_or_else(|| unreachable!("checked above"));
                if stream.fin_received && stream.buf.is_empty() {
                    if !stream.reader.at_boundary() || !stream.head_seen {
                        self.stream_failed(stream_id, ErrorCode::RequestIncomplete, events);
                        return Ok(());
                    }
                    if !stream.read_done {
                        stream.read_done = true;
                        events.push(Event::Finished { stream_id });
                    }
                    // The entry survives until the write side has also
                    // queued its FIN (the response may not have started
                    // yet).
                    self.maybe_remove(stream_id);
                }
                return Ok(());
            };

            match event {
                FrameEvent::Headers(block) => self.on_request_headers(stream_id, &block, events)?,
                FrameEvent::Data { chunk, last: _ } => {
                    let stream = self
                        .requests
                        .get_mut(&stream_id)
                        .unwrap_or_else(|| unreachable!("checked above"));
                    if !stream.head_seen || stream.trailers_seen {
                        return Err(self.connection_error(
                            ErrorCode::FrameUnexpected,
                            "DATA outside the HEADERS..trailers envelope".into(),
                        ));
                    }
                    if !chunk.is_empty() {
                        events.push(Event::Data { stream_id, data: chunk });
                    }
                }
                FrameEvent::PushPromise => {
                    return Err(self.connection_error(
                        ErrorCode::FrameUnexpected,
                        "PUSH_PROMISE with push disabled".into(),
                    ));
                }
                FrameEvent::Settings(_) | FrameEvent::GoAway(_) | FrameEvent::CancelPush(_)
                | FrameEvent::MaxPushId(_) => {
                    return Err(self.connection_error(
                        ErrorCode::FrameUnexpected,
                        "control frame on request stream".into(),
                    ));
                }
                FrameEvent::Skipped => {}
            }
        }
    }

    fn on_request_headers(
        &mut self,
        stream_id: u64,
        block: &[u8],
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        let outcome = match self.qpack_dec.decode_section(stream_id, block) {
            Ok(outcome) => outcome,
            Err(error) => {
                let detail = error.to_string();
                return Err(self.connection_error(ErrorCode::QpackDecompressionFailed, detail));
            }
        };
        self.flush_decoder_feedback();

        match outcome {
            qpack::SectionOutcome::Blocked => {
                if let Some(stream) = self.requests.get_mut(&stream_id) {
                    stream.blocked = true;
                }
                Ok(())
            }
            qpack::SectionOutcome::Decoded(fields) => {
                self.deliver_section(stream_id, fields, events);
                Ok(())
            }
        }
    }

    /// Turns a decoded field section into head/trailer events.
    fn deliver_section(
        &mut self,
        stream_id: u64,
        fields: Vec<(Bytes, Bytes)>,
        events: &mut Vec<Event>,
    ) {
        let Some(stream) = self.requests.get_mut(&stream_id) else {
            return;
        };

        if stream.head_seen {
            if stream.trailers_seen {
                self.stream_failed(stream_id, ErrorCode::FrameUnexpected, events);
                return;
            }
            match message::split_trailers(fields) {
                Ok(trailers) => {
                    stream.trailers_seen = true;
                    events.push(Event::Trailers { stream_id, trailers });
                }
                Err(_) => self.stream_failed(stream_id, ErrorCode::MessageError, events),
            }
            return;
        }

        let head = match self.role {
            Role::Client => message::split_response(fields),
            Role::Server => message::split_request(fields),
        };
        match head {
            Ok(PeerHead::Response(response)) if response.status.is_informational() => {
                events.push(Event::Headers {
                    stream_id,
                    head: PeerHead::Response(response),
                    fin: false,
                });
            }
            Ok(head) => {
                stream.head_seen = true;
                let fin = stream.fin_received && stream.buf.is_empty() && stream.reader.at_boundary();
                events.push(Event::Headers { stream_id, head, fin });
            }
            Err(error) => {
                tracing::warn!(target: "trireme::h3::conn", stream_id, %error, "malformed message head");
                self.stream_failed(stream_id, ErrorCode::MessageError, events);
            }
        }
    }

    /// Sections that unblocked after encoder-stream progress.
    fn drain_unblocked(&mut self, events: &mut Vec<Event>) -> Result<(), Error> {
        for (stream_id, fields) in self.qpack_dec.take_unblocked() {
            if let Some(stream) = self.requests.get_mut(&stream_id) {
                stream.blocked = false;
            }
            self.deliver_section(stream_id, fields, events);
            self.flush_decoder_feedback();
            // Frames queued behind the blocked section resume.
            self.process_request_stream(stream_id, events)?;
        }
        Ok(())
    }

    fn encode_section_to(&mut self, stream_id: u64, fields: &message::FieldList) -> Result<(), Error> {
        let mut block = Vec::new();
        let mut instructions = Vec::new();
        self.qpack_enc.encode_section(
            stream_id,
            fields.iter().map(|(n, v, s)| (n.as_slice(), v.as_slice(), *s)),
            &mut block,
            &mut instructions,
        )?;
        if !instructions.is_empty() {
            let encoder_stream = self.local_encoder.ok_or_else(|| {
                Error::MalformedMessage("local uni streams not registered".into())
            })?;
            self.outgoing
                .entry(encoder_stream)
                .or_default()
                .data
                .extend_from_slice(&instructions);
        }
        let out = self.outgoing.entry(stream_id).or_default();
        build::headers(&block, &mut out.data);
        Ok(())
    }

    fn flush_decoder_feedback(&mut self) {
        let feedback = self.qpack_dec.take_decoder_stream();
        if feedback.is_empty() {
            return;
        }
        if let Some(decoder_stream) = self.local_decoder {
            self.outgoing
                .entry(decoder_stream)
                .or_default()
                .data
                .extend_from_slice(&feedback);
        }
    }

    /// Drops a request stream's bookkeeping once both directions are
    /// finished: peer FIN consumed and our FIN queued.
    fn maybe_remove(&mut self, stream_id: u64) {
        let done = self
            .requests
            .get(&stream_id)
            .is_some_and(|s| s.read_done && s.write_done);
        if done {
            self.requests.remove(&stream_id);
        }
    }

    /// Request-level failure: drop the stream, tell the caller to
    /// reset it.
    fn stream_failed(&mut self, stream_id: u64, code: ErrorCode, events: &mut Vec<Event>) {
        self.requests.remove(&stream_id);
        self.outgoing.remove(&stream_id);
        self.qpack_dec.cancel_stream(stream_id);
        self.flush_decoder_feedback();
        events.push(Event::StreamError { stream_id, code });
    }

    fn connection_error(&mut self, code: ErrorCode, detail: String) -> Error {
        tracing::warn!(target: "trireme::h3::conn", ?code, detail, "connection error");
        let error = match code {
            ErrorCode::QpackDecompressionFailed
            | ErrorCode::QpackEncoderStreamError
            | ErrorCode::QpackDecoderStreamError => Error::CompressionError(detail),
            _ => Error::UnexpectedFrame(detail),
        };
        self.fatal = Some((code, error.clone()));
        error
    }
}
