//! The HTTP/2 connection engine.
//!
//! Input-driven: [`H2Connection::recv`] consumes transport bytes and
//! returns events, [`H2Connection::poll_output`] drains the bytes the
//! engine wants written (control frames first, then flow-controlled
//! DATA scheduled round-robin across ready streams) together with any
//! stream-closure events the sending side produced.

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};

use crate::config::H2Config;
use crate::error::Error;
use crate::http::{FieldSection, Request, Response};
use crate::protocols::hpack;
use crate::protocols::message::{self, PeerHead};

use super::flow::{RecvWindow, SendWindow};
use super::frame::{self, build, ErrorCode, Frame, FrameHeader, Settings};
use super::stream::{State, Stream};
use super::PREFACE;

/// Accumulated header blocks may not exceed this, whatever the peer's
/// frame size; CONTINUATION floods die here.
const MAX_HEADER_BLOCK: usize = 256 * 1024;

/// Ids of locally-reset streams we keep tolerating frames for.
const RESET_GRACE_ENTRIES: usize = 64;

/// Events surfaced by [`H2Connection::recv`].
#[derive(Debug)]
pub enum Event {
    /// The peer's SETTINGS arrived (and were acknowledged).
    RemoteSettings(Settings),
    /// The peer acknowledged our SETTINGS.
    SettingsAcked,
    /// A request or response head arrived on `stream_id`.
    Headers {
        stream_id: u32,
        head: PeerHead,
        end_stream: bool,
    },
    /// Response interim (1xx) head; the final head is still to come.
    Interim { stream_id: u32, response: Response },
    /// Body bytes arrived.
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    /// Trailers arrived; the stream's remote side is done.
    Trailers { stream_id: u32, trailers: FieldSection },
    /// The stream was reset (by the peer, or locally after a stream
    /// error).
    Reset { stream_id: u32, code: ErrorCode },
    /// GOAWAY arrived; streams above `last_stream_id` were refused.
    GoAway { last_stream_id: u32, code: ErrorCode },
    /// A PING we sent came back.
    PingResponse([u8; 8]),
    /// Both directions finished; the stream id is gone.
    StreamClosed { stream_id: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// In-progress HEADERS + CONTINUATION assembly.
#[derive(Debug)]
struct ContinuationState {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
    /// Trailer block (the stream already has its head).
    is_trailers: bool,
}

/// One HTTP/2 connection, either role.
#[derive(Debug)]
pub struct H2Connection {
    role: Role,
    read_buf: BytesMut,
    output: Vec<u8>,
    preface_pending: bool,

    local_settings: Settings,
    peer_settings: Settings,
    local_settings_acked: bool,

    hpack_enc: hpack::Encoder,
    hpack_dec: hpack::Decoder,

    conn_send: SendWindow,
    conn_recv: RecvWindow,

    streams: HashMap<u32, Stream>,
    ready: VecDeque<u32>,
    next_stream_id: u32,
    /// Highest peer-initiated stream id seen.
    highest_peer_stream: u32,

    continuation: Option<ContinuationState>,
    recently_reset: VecDeque<u32>,

    goaway_sent: Option<(u32, ErrorCode)>,
    goaway_received: Option<(u32, ErrorCode)>,
    fatal: Option<Error>,
    /// Stream-closure events produced by the send paths, surfaced by
    /// the next `recv` or `poll_output`.
    pending_events: Vec<Event>,
}

impl H2Connection {
    /// Client connection: queues the preface and our SETTINGS.
    #[must_use]
    pub fn new_client(config: &H2Config) -> Self {
        let mut conn = Self::new(Role::Client, config);
        conn.output.extend_from_slice(PREFACE);
        let values = conn.local_settings.to_values();
        build::settings(&values, &mut conn.output);
        conn
    }

    /// Server connection: queues our SETTINGS, expects the preface.
    #[must_use]
    pub fn new_server(config: &H2Config) -> Self {
        let mut conn = Self::new(Role::Server, config);
        conn.preface_pending = true;
        let values = conn.local_settings.to_values();
        build::settings(&values, &mut conn.output);
        conn
    }

    fn new(role: Role, config: &H2Config) -> Self {
        let local_settings = Settings {
            header_table_size: config.header_table_size,
            enable_push: false,
            max_concurrent_streams: Some(config.max_concurrent_streams),
            initial_window_size: config.initial_window_size,
            max_frame_size: config.max_frame_size,
            max_header_list_size: Some(config.max_header_list_size),
        };
        let peer_settings = Settings::default();
        H2Connection {
            role,
            read_buf: BytesMut::new(),
            output: Vec::new(),
            preface_pending: false,
            hpack_enc: hpack::Encoder::new(peer_settings.header_table_size as usize),
            hpack_dec: hpack::Decoder::new(
                local_settings.header_table_size as usize,
                config.max_header_list_size as usize,
            ),
            conn_send: SendWindow::new(65_535),
            conn_recv: RecvWindow::new(65_535),
            streams: HashMap::new(),
            ready: VecDeque::new(),
            next_stream_id: if role == Role::Client { 1 } else { 2 },
            highest_peer_stream: 0,
            continuation: None,
            recently_reset: VecDeque::new(),
            goaway_sent: None,
            goaway_received: None,
            fatal: None,
            pending_events: Vec::new(),
            local_settings,
            peer_settings,
            local_settings_acked: false,
        }
    }

    /// True while new streams may be opened here.
    #[must_use]
    pub fn can_open_stream(&self) -> bool {
        self.fatal.is_none()
            && self.goaway_received.is_none()
            && self.goaway_sent.is_none()
            && self
                .peer_settings
                .max_concurrent_streams
                .is_none_or(|max| (self.streams.len() as u32) < max)
    }

    /// A connection is reusable for pooling while no error occurred
    /// and neither side is draining.
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        self.fatal.is_none() && self.goaway_received.is_none() && self.goaway_sent.is_none()
    }

    /// Opens a client stream carrying `request`'s head.
    ///
    /// `end_stream` is set when the request has no body.
    pub fn open_stream(&mut self, request: &Request, end_stream: bool) -> Result<u32, Error> {
        debug_assert_eq!(self.role, Role::Client);
        if let Some(fatal) = &self.fatal {
            return Err(fatal.clone());
        }
        if self.goaway_received.is_some() || self.goaway_sent.is_some() {
            return Err(Error::OriginDraining);
        }
        if !self.can_open_stream() {
            return Err(Error::Busy);
        }
        request.validate(true)?;

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let mut block = Vec::new();
        let fields = message::request_fields(request);
        self.hpack_enc.encode_block(
            fields.iter().map(|(n, v, s)| (n.as_slice(), v.as_slice(), *s)),
            &mut block,
        );

        build::headers(
            stream_id,
            &block,
            end_stream,
            self.peer_settings.max_frame_size as usize,
            &mut self.output,
        );

        let mut stream = Stream::new(
            stream_id,
            self.peer_settings.initial_window_size,
            self.local_settings.initial_window_size,
        );
        if end_stream {
            stream.state = stream.state.close_local();
            stream.end_queued = true;
        }
        self.streams.insert(stream_id, stream);
        tracing::debug!(target: "trireme::h2::conn", stream_id, "stream opened");
        Ok(stream_id)
    }

    /// Sends a response head on a server stream. Interim (1xx) heads
    /// may precede the final one.
    pub fn send_response(
        &mut self,
        stream_id: u32,
        response: &Response,
        end_stream: bool,
    ) -> Result<(), Error> {
        debug_assert_eq!(self.role, Role::Server);
        if let Some(fatal) = &self.fatal {
            return Err(fatal.clone());
        }
        let stream = self.streams.get_mut(&stream_id).ok_or(Error::StreamGone)?;
        if !stream.state.can_send() {
            return Err(Error::StreamGone);
        }
        // Exactly one final response per request; interim heads may
        // precede it.
        if stream.head_sent && !response.status.is_informational() {
            return Err(Error::MalformedMessage("response already sent".into()));
        }
        if !response.status.is_informational() {
            stream.head_sent = true;
        }

        let mut block = Vec::new();
        let fields = message::response_fields(response);
        self.hpack_enc.encode_block(
            fields.iter().map(|(n, v, s)| (n.as_slice(), v.as_slice(), *s)),
            &mut block,
        );

        let end_stream = end_stream && !response.status.is_informational();
        build::headers(
            stream_id,
            &block,
            end_stream,
            self.peer_settings.max_frame_size as usize,
            &mut self.output,
        );
        if end_stream {
            // Closure events from the send path surface on the next
            // recv or poll_output.
            let mut closed = Vec::new();
            self.close_local(stream_id, &mut closed);
            self.pending_events.extend(closed);
        }
        Ok(())
    }

    /// Queues body bytes; the scheduler drains them under flow control.
    pub fn send_body(&mut self, stream_id: u32, data: Bytes, end: bool) -> Result<(), Error> {
        if let Some(fatal) = &self.fatal {
            return Err(fatal.clone());
        }
        let stream = self.streams.get_mut(&stream_id).ok_or(Error::StreamGone)?;
        if !stream.state.can_send() || stream.end_queued {
            return Err(Error::StreamGone);
        }
        stream.outbound.push_back((data, end));
        if end {
            stream.end_queued = true;
        }
        self.mark_ready(stream_id);
        Ok(())
    }

    /// Queues trailers; they follow the final queued DATA frame.
    pub fn send_trailers(&mut self, stream_id: u32, trailers: FieldSection) -> Result<(), Error> {
        if let Some(fatal) = &self.fatal {
            return Err(fatal.clone());
        }
        let stream = self.streams.get_mut(&stream_id).ok_or(Error::StreamGone)?;
        if !stream.state.can_send() || stream.trailers.is_some() {
            return Err(Error::StreamGone);
        }
        stream.trailers = Some(trailers);
        stream.end_queued = true;
        self.mark_ready(stream_id);
        Ok(())
    }

    /// Resets a stream; used for cancellation (`ErrorCode::Cancel`).
    pub fn reset_stream(&mut self, stream_id: u32, code: ErrorCode) -> Result<(), Error> {
        if self.streams.remove(&stream_id).is_none() {
            return Err(Error::StreamGone);
        }
        build::rst_stream(stream_id, code, &mut self.output);
        self.remember_reset(stream_id);
        tracing::debug!(target: "trireme::h2::conn", stream_id, ?code, "stream reset locally");
        Ok(())
    }

    /// Sends a PING for liveness/RTT measurement.
    pub fn ping(&mut self, payload: [u8; 8]) {
        build::ping(payload, false, &mut self.output);
    }

    /// Starts draining: no new streams in either direction.
    pub fn go_away(&mut self, code: ErrorCode) {
        if self.goaway_sent.is_none() {
            let last = self.highest_peer_stream;
            build::goaway(last, code, &mut self.output);
            self.goaway_sent = Some((last, code));
        }
    }

    /// Consumes transport bytes, producing events.
    pub fn recv(&mut self, data: &[u8]) -> Result<Vec<Event>, Error> {
        if let Some(fatal) = &self.fatal {
            return Err(fatal.clone());
        }
        self.read_buf.extend_from_slice(data);
        let mut events = std::mem::take(&mut self.pending_events);

        if self.preface_pending {
            if self.read_buf.len() < PREFACE.len() {
                if !PREFACE.starts_with(&self.read_buf[..]) {
                    return Err(self.connection_error(
                        ErrorCode::ProtocolError,
                        "bad connection preface".into(),
                    ));
                }
                return Ok(events);
            }
            if &self.read_buf[..PREFACE.len()] != PREFACE {
                return Err(self.connection_error(
                    ErrorCode::ProtocolError,
                    "bad connection preface".into(),
                ));
            }
            let _ = self.read_buf.split_to(PREFACE.len());
            self.preface_pending = false;
        }

        loop {
            let (header, payload) =
                match frame::next_frame(&mut self.read_buf, self.local_settings.max_frame_size) {
                    Ok(Some(pair)) => pair,
                    Ok(None) => return Ok(events),
                    Err((code, detail)) => return Err(self.connection_error(code, detail)),
                };

            let frame = match Frame::parse(&header, payload) {
                Ok(frame) => frame,
                Err((code, detail)) => return Err(self.connection_error(code, detail)),
            };

            // A header block in flight permits nothing but its own
            // CONTINUATIONs.
            if let Some(pending) = &self.continuation {
                match &frame {
                    Frame::Continuation { stream_id, .. } if *stream_id == pending.stream_id => {}
                    _ => {
                        return Err(self.connection_error(
                            ErrorCode::ProtocolError,
                            "frame interleaved inside header block".into(),
                        ));
                    }
                }
            }

            if let Err(error) = self.handle_frame(frame, &mut events) {
                return Err(error);
            }
        }
    }

    /// Bytes the engine wants on the wire (control frames first, then
    /// DATA scheduled round-robin under both window levels), plus the
    /// stream-closure events the send paths and the scheduler
    /// produced: a stream whose local side finishes last closes here,
    /// not inside `recv`.
    pub fn poll_output(&mut self) -> (Vec<u8>, Vec<Event>) {
        let mut out = std::mem::take(&mut self.output);
        let mut events = std::mem::take(&mut self.pending_events);
        self.schedule_data(&mut out, &mut events);
        (out, events)
    }

    /// The transport closed.
    pub fn on_eof(&mut self) -> Result<(), Error> {
        self.fatal = Some(Error::NetworkClosed);
        if self.streams.is_empty() {
            Ok(())
        } else {
            Err(Error::NetworkClosed)
        }
    }

    /// A caller deadline expired for `stream_id`: cancel it.
    pub fn on_timeout(&mut self, stream_id: u32) {
        let _ = self.reset_stream(stream_id, ErrorCode::Cancel);
    }

    #[must_use]
    pub fn peer_settings(&self) -> &Settings {
        &self.peer_settings
    }

    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    // ===== frame dispatch =====

    fn handle_frame(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<(), Error> {
        match frame {
            Frame::Settings { ack, values } => self.on_settings(ack, &values, events),
            Frame::Headers {
                stream_id,
                block,
                end_headers,
                end_stream,
            } => self.on_headers(stream_id, block, end_headers, end_stream, events),
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => self.on_continuation(stream_id, block, end_headers, events),
            Frame::Data {
                stream_id,
                data,
                end_stream,
                flow_len,
            } => self.on_data(stream_id, data, end_stream, flow_len, events),
            Frame::WindowUpdate { stream_id, increment } => {
                self.on_window_update(stream_id, increment)
            }
            Frame::RstStream { stream_id, code } => self.on_rst_stream(stream_id, code, events),
            Frame::Ping { ack, payload } => {
                if ack {
                    events.push(Event::PingResponse(payload));
                } else {
                    build::ping(payload, true, &mut self.output);
                }
                Ok(())
            }
            Frame::GoAway { last_stream_id, code, .. } => {
                self.on_goaway(last_stream_id, code, events)
            }
            Frame::PushPromise { .. } => Err(self.connection_error(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE with push disabled".into(),
            )),
            Frame::Priority { .. } | Frame::Unknown { .. } => Ok(()),
        }
    }

    fn on_settings(
        &mut self,
        ack: bool,
        values: &[(u16, u32)],
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        if ack {
            self.local_settings_acked = true;
            events.push(Event::SettingsAcked);
            return Ok(());
        }

        let old_initial = self.peer_settings.initial_window_size;
        if let Err((code, detail)) = self.peer_settings.apply(values) {
            return Err(self.connection_error(code, detail));
        }

        // Header table bound changed: the encoder must announce it.
        self.hpack_enc
            .set_max_table_capacity(self.peer_settings.header_table_size as usize);

        // INITIAL_WINDOW_SIZE adjusts every open stream's send window
        // by the delta.
        let delta = i64::from(self.peer_settings.initial_window_size) - i64::from(old_initial);
        if delta != 0 {
            for stream in self.streams.values_mut() {
                if let Err((code, detail)) = stream.send_window.widen(delta) {
                    return Err(self.connection_error(code, detail));
                }
            }
            let ready: Vec<u32> = self
                .streams
                .values()
                .filter(|s| s.has_pending_output())
                .map(|s| s.id)
                .collect();
            for id in ready {
                self.mark_ready(id);
            }
        }

        build::settings_ack(&mut self.output);
        events.push(Event::RemoteSettings(self.peer_settings.clone()));
        Ok(())
    }

    fn on_headers(
        &mut self,
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
        end_stream: bool,
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        let is_trailers = match self.classify_headers(stream_id)? {
            HeadersKind::NewRequest => {
                // Peer-opened stream: admit it before decoding.
                if let Some(max) = self.local_settings.max_concurrent_streams {
                    if self.streams.len() as u32 >= max {
                        build::rst_stream(stream_id, ErrorCode::RefusedStream, &mut self.output);
                        self.remember_reset(stream_id);
                        self.highest_peer_stream = stream_id;
                        // The block still mutates HPACK state.
                        self.decode_discard(stream_id, block, end_headers, end_stream)?;
                        return Ok(());
                    }
                }
                self.highest_peer_stream = stream_id;
                let stream = Stream::new(
                    stream_id,
                    self.peer_settings.initial_window_size,
                    self.local_settings.initial_window_size,
                );
                self.streams.insert(stream_id, stream);
                false
            }
            HeadersKind::ResponseHead => false,
            HeadersKind::Trailers => true,
            HeadersKind::Tolerated => {
                self.decode_discard(stream_id, block, end_headers, end_stream)?;
                return Ok(());
            }
            HeadersKind::HalfClosedViolation => {
                self.stream_error(stream_id, ErrorCode::StreamClosed, events);
                self.decode_discard(stream_id, block, end_headers, end_stream)?;
                return Ok(());
            }
        };

        if !end_headers {
            if block.len() > MAX_HEADER_BLOCK {
                return Err(self.connection_error(
                    ErrorCode::EnhanceYourCalm,
                    "header block too large".into(),
                ));
            }
            self.continuation = Some(ContinuationState {
                stream_id,
                block: BytesMut::from(&block[..]),
                end_stream,
                is_trailers,
            });
            return Ok(());
        }
        self.finish_header_block(stream_id, &block, end_stream, is_trailers, events)
    }

    fn on_continuation(
        &mut self,
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        let Some(pending) = &mut self.continuation else {
            return Err(self.connection_error(
                ErrorCode::ProtocolError,
                "CONTINUATION without open header block".into(),
            ));
        };
        debug_assert_eq!(pending.stream_id, stream_id);

        if pending.block.len() + block.len() > MAX_HEADER_BLOCK {
            return Err(self.connection_error(
                ErrorCode::EnhanceYourCalm,
                "header block too large".into(),
            ));
        }
        pending.block.extend_from_slice(&block);
        if !end_headers {
            return Ok(());
        }

        let pending = self
            .continuation
            .take()
            .unwrap_or_else(|| unreachable!("checked above"));
        let block = pending.block.freeze();
        self.finish_header_block(
            stream_id,
            &block,
            pending.end_stream,
            pending.is_trailers,
            events,
        )
    }

    /// What an incoming HEADERS frame means for this stream id.
    fn classify_headers(&mut self, stream_id: u32) -> Result<HeadersKind, Error> {
        if let Some(stream) = self.streams.get(&stream_id) {
            if !stream.state.can_recv() {
                // Stream error, not connection error: the block still
                // has to feed HPACK.
                return Ok(HeadersKind::HalfClosedViolation);
            }
            return Ok(if stream.head_received {
                HeadersKind::Trailers
            } else if self.role == Role::Client {
                HeadersKind::ResponseHead
            } else {
                // A server stream exists only after its opening
                // HEADERS, so a second non-trailing block is trailers
                // territory; head_received is set then.
                HeadersKind::Trailers
            });
        }

        match self.role {
            Role::Server => {
                if stream_id % 2 == 0 {
                    return Err(self.connection_error(
                        ErrorCode::ProtocolError,
                        "client used an even stream id".into(),
                    ));
                }
                if stream_id <= self.highest_peer_stream {
                    if self.recently_reset.contains(&stream_id) {
                        return Ok(HeadersKind::Tolerated);
                    }
                    return Err(self.connection_error(
                        ErrorCode::ProtocolError,
                        "stream id not strictly increasing".into(),
                    ));
                }
                if let Some((last, _)) = self.goaway_sent {
                    if stream_id > last {
                        // Refused while draining; the block still has
                        // to pass through HPACK.
                        return Ok(HeadersKind::Tolerated);
                    }
                }
                Ok(HeadersKind::NewRequest)
            }
            Role::Client => {
                if self.recently_reset.contains(&stream_id) {
                    return Ok(HeadersKind::Tolerated);
                }
                Err(self.connection_error(
                    ErrorCode::ProtocolError,
                    format!("HEADERS on unknown stream {stream_id}"),
                ))
            }
        }
    }

    /// Runs a header block through HPACK purely for table effects.
    fn decode_discard(
        &mut self,
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
        end_stream: bool,
    ) -> Result<(), Error> {
        if !end_headers {
            self.continuation = Some(ContinuationState {
                stream_id,
                block: BytesMut::from(&block[..]),
                end_stream,
                is_trailers: false,
            });
            // Completion routes through finish_header_block for a
            // stream that no longer exists; Tolerated handling there.
            return Ok(());
        }
        self.hpack_decode(&block).map(|_| ())
    }

    fn finish_header_block(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
        is_trailers: bool,
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        let decoded = self.hpack_decode(block)?;

        if !self.streams.contains_key(&stream_id) {
            // Tolerated block on a refused/reset stream: table state is
            // updated, nothing else happens.
            return Ok(());
        }

        if is_trailers {
            if !end_stream {
                self.stream_error(stream_id, ErrorCode::ProtocolError, events);
                return Ok(());
            }
            match message::split_trailers(decoded) {
                Ok(trailers) => {
                    events.push(Event::Trailers { stream_id, trailers });
                    self.close_remote(stream_id, events);
                }
                Err(_) => self.stream_error(stream_id, ErrorCode::ProtocolError, events),
            }
            return Ok(());
        }

        let head = match self.role {
            Role::Client => message::split_response(decoded),
            Role::Server => message::split_request(decoded),
        };
        match head {
            Ok(PeerHead::Response(response)) if response.status.is_informational() => {
                if end_stream {
                    self.stream_error(stream_id, ErrorCode::ProtocolError, events);
                    return Ok(());
                }
                events.push(Event::Interim { stream_id, response });
            }
            Ok(head) => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.head_received = true;
                }
                events.push(Event::Headers { stream_id, head, end_stream });
                if end_stream {
                    self.close_remote(stream_id, events);
                }
            }
            Err(error) => {
                tracing::warn!(target: "trireme::h2::conn", stream_id, %error, "malformed message head");
                self.stream_error(stream_id, ErrorCode::ProtocolError, events);
            }
        }
        Ok(())
    }

    fn hpack_decode(&mut self, block: &[u8]) -> Result<Vec<(Bytes, Bytes)>, Error> {
        let mut decoded = Vec::new();
        let result = self.hpack_dec.decode_block(block, |name, value| {
            decoded.push((
                Bytes::copy_from_slice(name),
                Bytes::copy_from_slice(value),
            ));
            Ok(())
        });
        match result {
            Ok(()) => Ok(decoded),
            Err(error) => {
                // HPACK desync cannot be repaired.
                let detail = error.to_string();
                Err(self.connection_error(ErrorCode::CompressionError, detail))
            }
        }
    }

    fn on_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        flow_len: u32,
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        // Connection-level credit is charged no matter what happens to
        // the stream, including for recently-reset ids.
        if let Err((code, detail)) = self.conn_recv.receive(flow_len) {
            return Err(self.connection_error(code, detail));
        }
        if let Some(increment) = self.conn_recv.replenish() {
            build::window_update(0, increment, &mut self.output);
        }

        if self.recently_reset.contains(&stream_id) {
            return Ok(());
        }
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Err(self.connection_error(
                ErrorCode::ProtocolError,
                format!("DATA on idle or closed stream {stream_id}"),
            ));
        };
        if !stream.state.can_recv() {
            self.stream_error(stream_id, ErrorCode::StreamClosed, events);
            return Ok(());
        }

        if let Err((code, detail)) = stream.recv_window.receive(flow_len) {
            return Err(self.connection_error(code, detail));
        }
        if let Some(increment) = stream.recv_window.replenish() {
            build::window_update(stream_id, increment, &mut self.output);
        }

        events.push(Event::Data { stream_id, data, end_stream });
        if end_stream {
            self.close_remote(stream_id, events);
        }
        Ok(())
    }

    fn on_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), Error> {
        if increment == 0 {
            return Err(self.connection_error(
                ErrorCode::ProtocolError,
                "WINDOW_UPDATE of zero".into(),
            ));
        }
        if stream_id == 0 {
            if let Err((code, detail)) = self.conn_send.widen(i64::from(increment)) {
                return Err(self.connection_error(code, detail));
            }
            let ready: Vec<u32> = self
                .streams
                .values()
                .filter(|s| s.has_pending_output())
                .map(|s| s.id)
                .collect();
            for id in ready {
                self.mark_ready(id);
            }
            return Ok(());
        }
        // Updates for departed streams are ignored.
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if let Err((code, detail)) = stream.send_window.widen(i64::from(increment)) {
                return Err(self.connection_error(code, detail));
            }
            if stream.has_pending_output() {
                self.mark_ready(stream_id);
            }
        }
        Ok(())
    }

    fn on_rst_stream(
        &mut self,
        stream_id: u32,
        code: ErrorCode,
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        let peer_initiated = match self.role {
            Role::Server => stream_id % 2 == 1,
            Role::Client => stream_id % 2 == 0,
        };
        let known = self.streams.remove(&stream_id).is_some();
        if known {
            events.push(Event::Reset { stream_id, code });
            events.push(Event::StreamClosed { stream_id });
            return Ok(());
        }
        let idle = if peer_initiated {
            stream_id > self.highest_peer_stream
        } else {
            stream_id >= self.next_stream_id
        };
        if idle {
            return Err(self.connection_error(
                ErrorCode::ProtocolError,
                "RST_STREAM on idle stream".into(),
            ));
        }
        Ok(())
    }

    fn on_goaway(
        &mut self,
        last_stream_id: u32,
        code: ErrorCode,
        events: &mut Vec<Event>,
    ) -> Result<(), Error> {
        if let Some((previous, _)) = self.goaway_received {
            if last_stream_id > previous {
                return Err(self.connection_error(
                    ErrorCode::ProtocolError,
                    "GOAWAY last-stream-id increased".into(),
                ));
            }
        }
        self.goaway_received = Some((last_stream_id, code));
        events.push(Event::GoAway { last_stream_id, code });

        // Streams above the cut line were never processed; surface
        // them as refused so idempotent requests can retry elsewhere.
        let refused: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|&id| {
                let ours = match self.role {
                    Role::Client => id % 2 == 1,
                    Role::Server => id % 2 == 0,
                };
                ours && id > last_stream_id
            })
            .collect();
        for id in refused {
            self.streams.remove(&id);
            events.push(Event::Reset { stream_id: id, code: ErrorCode::RefusedStream });
            events.push(Event::StreamClosed { stream_id: id });
        }
        Ok(())
    }

    // ===== output scheduling =====

    fn mark_ready(&mut self, stream_id: u32) {
        if !self.ready.contains(&stream_id) {
            self.ready.push_back(stream_id);
        }
    }

    /// Round-robin DATA emission under min(stream window, connection
    /// window, peer max frame size).
    fn schedule_data(&mut self, out: &mut Vec<u8>, events: &mut Vec<Event>) {
        let max_frame = self.peer_settings.max_frame_size as usize;
        let mut made_progress = true;

        while made_progress {
            made_progress = false;
            for _ in 0..self.ready.len() {
                let Some(stream_id) = self.ready.pop_front() else {
                    break;
                };
                let conn_available = self.conn_send.available();
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    continue;
                };
                if !stream.has_pending_output() {
                    continue;
                }

                // Trailers go out once DATA is drained.
                if stream.outbound.is_empty() {
                    if let Some(trailers) = stream.trailers.take() {
                        let fields = message::trailer_fields(&trailers);
                        let mut block = Vec::new();
                        self.hpack_enc.encode_block(
                            fields.iter().map(|(n, v, s)| (n.as_slice(), v.as_slice(), *s)),
                            &mut block,
                        );
                        build::headers(stream_id, &block, true, max_frame, out);
                        made_progress = true;
                        self.close_local(stream_id, events);
                    }
                    continue;
                }

                let budget = (stream.send_window.available() as usize)
                    .min(conn_available as usize)
                    .min(max_frame);

                // Zero-length END_STREAM frames ride for free.
                if budget == 0 {
                    if stream.pending_bytes() == 0 && stream.trailers.is_none() {
                        let (_, end) = stream.outbound.pop_back().unwrap_or((Bytes::new(), true));
                        build::data(stream_id, &[], end, out);
                        made_progress = true;
                        stream.outbound.clear();
                        if end {
                            self.close_local(stream_id, events);
                        }
                    } else {
                        // Parked until a window opens.
                        self.ready.push_back(stream_id);
                    }
                    continue;
                }

                let mut payload = Vec::with_capacity(budget.min(stream.pending_bytes()));
                let mut ended = false;
                while payload.len() < budget {
                    let Some((mut chunk, end)) = stream.outbound.pop_front() else {
                        break;
                    };
                    let room = budget - payload.len();
                    if chunk.len() > room {
                        payload.extend_from_slice(&chunk.split_to(room));
                        stream.outbound.push_front((chunk, end));
                        break;
                    }
                    payload.extend_from_slice(&chunk);
                    if end {
                        ended = true;
                        break;
                    }
                }

                let end_frame = ended && stream.trailers.is_none();
                stream.send_window.consume(payload.len() as u32);
                self.conn_send.consume(payload.len() as u32);
                build::data(stream_id, &payload, end_frame, out);
                made_progress = true;

                let still_pending = self
                    .streams
                    .get(&stream_id)
                    .is_some_and(Stream::has_pending_output);
                if end_frame {
                    self.close_local(stream_id, events);
                } else if still_pending {
                    self.ready.push_back(stream_id);
                }
            }
        }
    }

    // ===== stream lifecycle =====

    fn close_local(&mut self, stream_id: u32, events: &mut Vec<Event>) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.state = stream.state.close_local();
            if stream.state == State::Closed {
                self.streams.remove(&stream_id);
                events.push(Event::StreamClosed { stream_id });
            }
        }
    }

    fn close_remote(&mut self, stream_id: u32, events: &mut Vec<Event>) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.state = stream.state.close_remote();
            if stream.state == State::Closed {
                self.streams.remove(&stream_id);
                events.push(Event::StreamClosed { stream_id });
            }
        }
    }

    /// Stream-level failure: RST and tell the application.
    fn stream_error(&mut self, stream_id: u32, code: ErrorCode, events: &mut Vec<Event>) {
        self.streams.remove(&stream_id);
        build::rst_stream(stream_id, code, &mut self.output);
        self.remember_reset(stream_id);
        events.push(Event::Reset { stream_id, code });
        events.push(Event::StreamClosed { stream_id });
    }

    fn remember_reset(&mut self, stream_id: u32) {
        if self.recently_reset.len() == RESET_GRACE_ENTRIES {
            self.recently_reset.pop_front();
        }
        self.recently_reset.push_back(stream_id);
    }

    /// Connection-level failure: GOAWAY, latch, surface.
    fn connection_error(&mut self, code: ErrorCode, detail: String) -> Error {
        tracing::warn!(target: "trireme::h2::conn", ?code, detail, "connection error");
        self.go_away(code);
        let error = frame::to_error(code, detail);
        self.fatal = Some(error.clone());
        error
    }
}

enum HeadersKind {
    NewRequest,
    ResponseHead,
    Trailers,
    /// Late frames for refused or recently-reset streams: the header
    /// block feeds HPACK, nothing else happens.
    Tolerated,
    /// HEADERS on a stream whose remote side already finished: reset
    /// the stream, still feed HPACK.
    HalfClosedViolation,
}

#[cfg(test)]
mod tests {
    use crate::http::{Method, StatusCode};

    use super::*;

    fn config() -> H2Config {
        H2Config::default()
    }

    fn pair() -> (H2Connection, H2Connection) {
        let mut client = H2Connection::new_client(&config());
        let mut server = H2Connection::new_server(&config());
        // Exchange prefaces and SETTINGS both ways.
        let c = client.poll_output().0;
        server.recv(&c).unwrap();
        let s = server.poll_output().0;
        client.recv(&s).unwrap();
        let c = client.poll_output().0;
        server.recv(&c).unwrap();
        (client, server)
    }

    fn request() -> Request {
        Request::get("example.com", "/")
    }

    #[test]
    fn handshake_exchanges_and_acks_settings() {
        let mut client = H2Connection::new_client(&config());
        let mut server = H2Connection::new_server(&config());

        let bytes = client.poll_output().0;
        assert!(bytes.starts_with(PREFACE));
        let events = server.recv(&bytes).unwrap();
        assert!(events.iter().any(|e| matches!(e, Event::RemoteSettings(_))));

        let bytes = server.poll_output().0;
        let events = client.recv(&bytes).unwrap();
        assert!(events.iter().any(|e| matches!(e, Event::RemoteSettings(_))));

        // Server sees our ack of its settings.
        let bytes = client.poll_output().0;
        let events = server.recv(&bytes).unwrap();
        assert!(events.iter().any(|e| matches!(e, Event::SettingsAcked)));
    }

    #[test]
    fn get_round_trip() {
        let (mut client, mut server) = pair();

        let stream_id = client.open_stream(&request(), true).unwrap();
        assert_eq!(stream_id, 1);
        let events = server.recv(&client.poll_output().0).unwrap();
        let request_head = events
            .iter()
            .find_map(|e| match e {
                Event::Headers { head: PeerHead::Request(r), end_stream, .. } => {
                    Some((r.clone(), *end_stream))
                }
                _ => None,
            })
            .expect("request head");
        assert_eq!(request_head.0.method, Method::Get);
        assert_eq!(request_head.0.authority, "example.com");
        assert!(request_head.1);
        assert_eq!(
            request_head.0.headers.get("host").unwrap().as_bytes(),
            b"example.com"
        );

        let mut response = Response::new(StatusCode::OK);
        response.headers.try_append(b"content-type", "text/plain").unwrap();
        server.send_response(stream_id, &response, false).unwrap();
        server
            .send_body(stream_id, Bytes::from_static(b"hello"), true)
            .unwrap();

        let events = client.recv(&server.poll_output().0).unwrap();
        let mut body = Vec::new();
        let mut status = None;
        for event in events {
            match event {
                Event::Headers { head: PeerHead::Response(r), .. } => status = Some(r.status),
                Event::Data { data, .. } => body.extend_from_slice(&data),
                _ => {}
            }
        }
        assert_eq!(status, Some(StatusCode::OK));
        assert_eq!(body, b"hello");
    }

    #[test]
    fn local_finish_surfaces_stream_closed() {
        let (mut client, mut server) = pair();
        let stream_id = client.open_stream(&request(), true).unwrap();
        server.recv(&client.poll_output().0).unwrap();

        // The server finishes after the client, so its side of the
        // stream closes during output scheduling.
        server
            .send_response(stream_id, &Response::new(StatusCode::OK), false)
            .unwrap();
        server.send_body(stream_id, Bytes::from_static(b"x"), true).unwrap();
        let (wire, events) = server.poll_output();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::StreamClosed { stream_id: id } if *id == stream_id)));
        assert_eq!(server.active_streams(), 0);
        client.recv(&wire).unwrap();
    }

    #[test]
    fn bodiless_response_closure_surfaces_on_next_poll() {
        let (mut client, mut server) = pair();
        let stream_id = client.open_stream(&request(), true).unwrap();
        server.recv(&client.poll_output().0).unwrap();

        // The close happens on the send path; the event arrives with
        // the next poll.
        let mut response = Response::new(StatusCode::NO_CONTENT);
        response.body = crate::http::BodyLength::Known(0);
        server.send_response(stream_id, &response, true).unwrap();
        let (_, events) = server.poll_output();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::StreamClosed { stream_id: id } if *id == stream_id)));
    }

    #[test]
    fn stream_ids_increase_by_two() {
        let (mut client, _) = pair();
        assert_eq!(client.open_stream(&request(), true).unwrap(), 1);
        assert_eq!(client.open_stream(&request(), true).unwrap(), 3);
        assert_eq!(client.open_stream(&request(), true).unwrap(), 5);
    }

    #[test]
    fn interleaved_data_respects_both_window_levels() {
        let (mut client, mut server) = pair();

        let s1 = client.open_stream(&request(), false).unwrap();
        let s2 = client.open_stream(&request(), false).unwrap();
        server.recv(&client.poll_output().0).unwrap();

        let chunk = Bytes::from(vec![0x42u8; 32 * 1024]);
        client.send_body(s1, chunk.clone(), true).unwrap();
        client.send_body(s2, chunk.clone(), true).unwrap();

        // Pump both directions until the bodies complete; the first
        // flight cannot exceed the 65535-byte connection window, so
        // WINDOW_UPDATEs are what let the final bytes through.
        let mut received = 0usize;
        let mut first_flight = None;
        let mut served = std::collections::HashSet::new();
        let mut ended = 0;
        for _ in 0..16 {
            let wire = client.poll_output().0;
            let events = server.recv(&wire).unwrap();
            let mut flight = 0usize;
            for event in events {
                if let Event::Data { stream_id, data, end_stream } = event {
                    flight += data.len();
                    served.insert(stream_id);
                    if end_stream {
                        ended += 1;
                    }
                }
            }
            first_flight.get_or_insert(flight);
            received += flight;
            client.recv(&server.poll_output().0).unwrap();
            if ended == 2 {
                break;
            }
        }

        assert_eq!(received, 64 * 1024);
        assert_eq!(ended, 2);
        assert!(first_flight.unwrap() <= 65_535);
        // Both streams were served, not one starved.
        assert!(served.contains(&s1) && served.contains(&s2));
    }

    #[test]
    fn connection_window_throttles_and_window_update_releases() {
        let (mut client, mut server) = pair();
        let s1 = client.open_stream(&request(), false).unwrap();
        server.recv(&client.poll_output().0).unwrap();

        // 100 KiB exceeds the 65535 connection window.
        client.send_body(s1, Bytes::from(vec![1u8; 100 * 1024]), true).unwrap();
        let wire = client.poll_output().0;
        let events = server.recv(&wire).unwrap();
        let first: usize = events
            .iter()
            .map(|e| match e {
                Event::Data { data, .. } => data.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(first, 65_535);

        // The server's replenishment lets the rest flow.
        let updates = server.poll_output().0;
        client.recv(&updates).unwrap();
        let wire = client.poll_output().0;
        let events = server.recv(&wire).unwrap();
        let second: usize = events
            .iter()
            .map(|e| match e {
                Event::Data { data, .. } => data.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(first + second, 100 * 1024);
    }

    #[test]
    fn ping_is_echoed() {
        let (mut client, mut server) = pair();
        client.ping(*b"pingpong");
        server.recv(&client.poll_output().0).unwrap();
        let events = client.recv(&server.poll_output().0).unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::PingResponse(p) if p == b"pingpong")));
    }

    #[test]
    fn goaway_refuses_new_streams() {
        let (mut client, mut server) = pair();
        server.go_away(ErrorCode::NoError);
        let events = client.recv(&server.poll_output().0).unwrap();
        assert!(events.iter().any(|e| matches!(e, Event::GoAway { .. })));
        assert!(matches!(
            client.open_stream(&request(), true),
            Err(Error::OriginDraining)
        ));
        assert!(!client.is_reusable());
    }

    #[test]
    fn goaway_marks_unprocessed_streams_refused() {
        let (mut client, _) = pair();
        let s1 = client.open_stream(&request(), true).unwrap();

        // Server claims it processed nothing.
        let mut goaway = Vec::new();
        build::goaway(0, ErrorCode::NoError, &mut goaway);
        let events = client.recv(&goaway).unwrap();
        assert!(events.iter().any(
            |e| matches!(e, Event::Reset { stream_id, code: ErrorCode::RefusedStream } if *stream_id == s1)
        ));
    }

    #[test]
    fn push_promise_is_a_protocol_error() {
        let (mut client, _) = pair();
        client.open_stream(&request(), true).unwrap();

        let mut wire = Vec::new();
        FrameHeader { length: 4, kind: frame::kind::PUSH_PROMISE, flags: frame::flags::END_HEADERS, stream_id: 1 }
            .encode(&mut wire);
        wire.extend_from_slice(&2u32.to_be_bytes());
        assert!(client.recv(&wire).is_err());
    }

    #[test]
    fn data_on_idle_stream_is_a_connection_error() {
        let (_, mut server) = pair();
        let mut wire = Vec::new();
        build::data(7, b"x", false, &mut wire);
        let err = server.recv(&wire).unwrap_err();
        assert!(matches!(err, Error::UnexpectedFrame(_)));
    }

    #[test]
    fn continuation_interleaving_is_a_connection_error() {
        let (mut client, mut server) = pair();
        client.open_stream(&request(), false).unwrap();
        let wire = client.poll_output().0;
        server.recv(&wire).unwrap();

        // Hand-build HEADERS without END_HEADERS, then a PING.
        let mut wire = Vec::new();
        FrameHeader { length: 0, kind: frame::kind::HEADERS, flags: 0, stream_id: 3 }.encode(&mut wire);
        build::ping(*b"intrlved", false, &mut wire);
        assert!(server.recv(&wire).is_err());
    }

    #[test]
    fn settings_initial_window_adjusts_open_streams() {
        let (mut client, mut server) = pair();
        let s1 = client.open_stream(&request(), false).unwrap();
        client.send_body(s1, Bytes::from(vec![9u8; 1_000]), false).unwrap();
        server.recv(&client.poll_output().0).unwrap();
        assert_eq!(
            client.streams.get(&s1).unwrap().send_window.available(),
            65_535 - 1_000
        );

        // Raising the initial size credits in-flight streams by the
        // delta.
        let mut settings = Vec::new();
        build::settings(&[(frame::setting::INITIAL_WINDOW_SIZE, 70_000)], &mut settings);
        client.recv(&settings).unwrap();
        assert_eq!(
            client.streams.get(&s1).unwrap().send_window.available(),
            70_000 - 1_000
        );

        // Shrinking below what is already in flight drives the window
        // negative, which clamps to zero credit without erroring.
        let mut settings = Vec::new();
        build::settings(&[(frame::setting::INITIAL_WINDOW_SIZE, 500)], &mut settings);
        client.recv(&settings).unwrap();
        assert_eq!(client.streams.get(&s1).unwrap().send_window.available(), 0);
    }

    #[test]
    fn concurrency_cap_blocks_open() {
        let mut client = H2Connection::new_client(&config());
        let mut server = H2Connection::new_server(&config());
        let c = client.poll_output().0;
        server.recv(&c).unwrap();

        // Server advertises a single concurrent stream.
        let mut wire = Vec::new();
        build::settings(&[(frame::setting::MAX_CONCURRENT_STREAMS, 1)], &mut wire);
        client.recv(&wire).unwrap();

        client.open_stream(&request(), true).unwrap();
        assert!(matches!(client.open_stream(&request(), true), Err(Error::Busy)));
    }

    #[test]
    fn trailers_round_trip() {
        let (mut client, mut server) = pair();
        let mut req = request();
        req.method = Method::Post;
        let s1 = client.open_stream(&req, false).unwrap();
        client.send_body(s1, Bytes::from_static(b"payload"), false).unwrap();
        let mut trailers = FieldSection::new();
        trailers.try_append(b"x-checksum", "abc123").unwrap();
        client.send_trailers(s1, trailers).unwrap();

        let events = server.recv(&client.poll_output().0).unwrap();
        assert!(events.iter().any(
            |e| matches!(e, Event::Trailers { trailers, .. } if trailers.get("x-checksum").is_some())
        ));
    }
}
