//! HTTP/1.1 client connection engine.
//!
//! One exchange at a time: a request is submitted, its response is
//! read to completion, and only then may the connection carry the next
//! request. Submitting early is refused with `Busy` rather than
//! pipelined.

use bytes::{Bytes, BytesMut};

use crate::error::Error;
use crate::http::{BodyLength, FieldSection, Method, Request, Response};

use super::body;
use super::chunked::{self, ChunkedDecoder};
use super::encoder;
use super::parser::{self, H1Limits};

/// Events produced by [`ClientConnection::recv`].
#[derive(Debug)]
pub enum ClientEvent {
    /// A 1xx interim response (forwarded for information; `Expect`
    /// handling is internal).
    Interim(Response),
    /// The final response head. Body chunks follow.
    ResponseHead(Response),
    /// A piece of the response body.
    Body(Bytes),
    /// The response is complete; the connection may be reusable.
    End { trailers: Option<FieldSection> },
}

#[derive(Debug)]
enum ReadState {
    /// No response expected.
    Idle,
    /// Waiting for (more of) a response head.
    Head,
    /// Reading a content-length body.
    FixedBody { remaining: u64 },
    /// Reading a chunked body.
    ChunkedBody(Box<ChunkedDecoder>),
    /// Reading until the server closes.
    UntilClose,
}

/// Client-side HTTP/1.1 connection state machine.
#[derive(Debug)]
pub struct ClientConnection {
    limits: H1Limits,
    lenient_lf: bool,
    read_buf: BytesMut,
    output: Vec<u8>,
    state: ReadState,
    /// Method of the in-flight request, for body-length decisions.
    method: Option<Method>,
    /// Framing of the request body being sent.
    request_body: BodyLength,
    request_body_done: bool,
    /// Body chunks withheld until `Expect: 100-continue` resolves.
    awaiting_continue: bool,
    withheld: Vec<(Bytes, bool)>,
    /// Keep-alive decision accumulated over the exchange.
    reusable: bool,
    closed: bool,
}

impl ClientConnection {
    #[must_use]
    pub fn new(limits: H1Limits, lenient_lf: bool) -> Self {
        ClientConnection {
            limits,
            lenient_lf,
            read_buf: BytesMut::new(),
            output: Vec::new(),
            state: ReadState::Idle,
            method: None,
            request_body: BodyLength::None,
            request_body_done: true,
            awaiting_continue: false,
            withheld: Vec::new(),
            reusable: true,
            closed: false,
        }
    }

    /// Submits a request. Fails with `Busy` while a previous exchange
    /// is still in flight and `NetworkClosed` on a dead connection.
    pub fn send_request(&mut self, request: &Request) -> Result<(), Error> {
        if self.closed {
            return Err(Error::NetworkClosed);
        }
        if !matches!(self.state, ReadState::Idle) {
            return Err(Error::Busy);
        }

        encoder::encode_request(request, &mut self.output)?;
        self.method = Some(request.method.clone());
        self.request_body = request.body;
        self.request_body_done = matches!(request.body, BodyLength::None);
        self.awaiting_continue = request.headers.has_token("expect", "100-continue")
            && !self.request_body_done;
        if request.headers.has_token("connection", "close") {
            self.reusable = false;
        }
        self.state = ReadState::Head;
        Ok(())
    }

    /// Queues a piece of the request body.
    ///
    /// While an `Expect: 100-continue` answer is pending the bytes are
    /// withheld; they flush on an interim response or
    /// [`ClientConnection::on_continue_timeout`].
    pub fn send_body(&mut self, data: Bytes, end: bool) -> Result<(), Error> {
        if self.closed {
            return Err(Error::NetworkClosed);
        }
        if self.request_body_done {
            return Err(Error::MalformedMessage("request body already finished".into()));
        }
        if self.awaiting_continue {
            self.withheld.push((data, end));
            return Ok(());
        }
        self.write_body(data, end);
        Ok(())
    }

    /// The configured continue-interval elapsed without an interim
    /// response: send the body anyway.
    pub fn on_continue_timeout(&mut self) {
        self.release_withheld();
    }

    /// Consumes transport bytes, producing response events.
    pub fn recv(&mut self, data: &[u8]) -> Result<Vec<ClientEvent>, Error> {
        if self.closed {
            return Err(Error::NetworkClosed);
        }
        self.read_buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            match &mut self.state {
                ReadState::Idle => {
                    if self.read_buf.is_empty() {
                        return Ok(events);
                    }
                    self.fail();
                    return Err(Error::BadSyntax("response bytes with no request in flight".into()));
                }
                ReadState::Head => {
                    let Some(head) = parser::parse_response(&mut self.read_buf, &self.limits).inspect_err(|_| self.fail())?
                    else {
                        return Ok(events);
                    };

                    if head.status.is_informational() {
                        if self.awaiting_continue {
                            self.release_withheld();
                        }
                        let mut interim = Response::new(head.status);
                        interim.reason = head.reason;
                        interim.headers = head.headers;
                        events.push(ClientEvent::Interim(interim));
                        continue;
                    }

                    // A final response ends any wait for 100-continue;
                    // an unsent body makes the framing unusable for
                    // keep-alive.
                    if self.awaiting_continue {
                        self.awaiting_continue = false;
                        self.withheld.clear();
                        if !self.request_body_done {
                            self.reusable = false;
                        }
                    }

                    let method = self.method.clone().unwrap_or(Method::Get);
                    let length = body::response_body_length(&method, head.status, &head.headers)
                        .inspect_err(|_| self.fail())?;

                    if head.headers.has_token("connection", "close") {
                        self.reusable = false;
                    }

                    let mut response = Response::new(head.status);
                    response.reason = head.reason;
                    response.headers = head.headers;
                    response.body = length;
                    events.push(ClientEvent::ResponseHead(response));

                    match length {
                        BodyLength::None | BodyLength::Known(0) => {
                            events.push(ClientEvent::End { trailers: None });
                            self.finish_exchange();
                        }
                        BodyLength::Known(n) => {
                            self.state = ReadState::FixedBody { remaining: n };
                        }
                        BodyLength::Chunked => {
                            self.state =
                                ReadState::ChunkedBody(Box::new(ChunkedDecoder::new(self.limits)));
                        }
                        BodyLength::UntilClose => {
                            self.reusable = false;
                            self.state = ReadState::UntilClose;
                        }
                    }
                }
                ReadState::FixedBody { remaining } => {
                    if self.read_buf.is_empty() {
                        return Ok(events);
                    }
                    let take = usize::try_from((*remaining).min(self.read_buf.len() as u64))
                        .expect("bounded by buffer length");
                    *remaining -= take as u64;
                    events.push(ClientEvent::Body(self.read_buf.split_to(take).freeze()));
                    if *remaining == 0 {
                        events.push(ClientEvent::End { trailers: None });
                        self.finish_exchange();
                    }
                }
                ReadState::ChunkedBody(decoder) => {
                    let progress = match decoder.feed(&mut self.read_buf) {
                        Ok(progress) => progress,
                        Err(e) => {
                            self.fail();
                            return Err(e);
                        }
                    };
                    let finished = progress.finished;
                    let trailers = finished.then(|| decoder.take_trailers()).flatten();
                    for data in progress.data {
                        events.push(ClientEvent::Body(data));
                    }
                    if finished {
                        events.push(ClientEvent::End { trailers });
                        self.finish_exchange();
                    } else {
                        return Ok(events);
                    }
                }
                ReadState::UntilClose => {
                    if !self.read_buf.is_empty() {
                        let all = self.read_buf.split().freeze();
                        events.push(ClientEvent::Body(all));
                    }
                    return Ok(events);
                }
            }
        }
    }

    /// The transport reported EOF.
    pub fn on_eof(&mut self) -> Result<Vec<ClientEvent>, Error> {
        self.reusable = false;
        self.closed = true;
        match self.state {
            ReadState::UntilClose => {
                self.state = ReadState::Idle;
                Ok(vec![ClientEvent::End { trailers: None }])
            }
            ReadState::Idle => Ok(Vec::new()),
            ReadState::FixedBody { .. } => Err(Error::Truncated),
            ReadState::Head | ReadState::ChunkedBody(_) => Err(Error::NetworkClosed),
        }
    }

    /// Cancels the in-flight exchange. HTTP/1.1 has no stream reset,
    /// so the connection is closed and must be discarded.
    pub fn cancel(&mut self) {
        tracing::debug!(target: "trireme::h1::client", "exchange cancelled, closing connection");
        self.fail();
    }

    /// A caller-enforced deadline expired; identical to cancellation.
    pub fn on_timeout(&mut self) {
        self.cancel();
    }

    /// Bytes the engine wants written to the transport.
    pub fn poll_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// True when the exchange is finished and keep-alive survived.
    #[must_use]
    pub fn is_reusable(&self) -> bool {
        !self.closed && self.reusable && matches!(self.state, ReadState::Idle)
    }

    fn write_body(&mut self, data: Bytes, end: bool) {
        match self.request_body {
            BodyLength::Chunked => {
                if !data.is_empty() {
                    chunked::encode_chunk(&data, &mut self.output);
                }
                if end {
                    chunked::encode_terminator(None, &mut self.output);
                }
            }
            _ => self.output.extend_from_slice(&data),
        }
        if end {
            self.request_body_done = true;
        }
    }

    fn release_withheld(&mut self) {
        self.awaiting_continue = false;
        for (data, end) in std::mem::take(&mut self.withheld) {
            self.write_body(data, end);
        }
    }

    fn finish_exchange(&mut self) {
        if !self.request_body_done {
            // Response completed before we finished sending: the
            // connection framing is ambiguous from here on.
            self.reusable = false;
        }
        self.method = None;
        self.state = ReadState::Idle;
    }

    fn fail(&mut self) {
        self.closed = true;
        self.reusable = false;
    }
}

#[cfg(test)]
mod tests {
    use crate::http::StatusCode;

    use super::*;

    fn connection() -> ClientConnection {
        ClientConnection::new(H1Limits::default(), false)
    }

    #[test]
    fn chunked_get_round_trip() {
        let mut conn = connection();
        let request = Request::get("h", "/x");
        conn.send_request(&request).unwrap();
        let head = conn.poll_output();
        assert!(head.starts_with(b"GET /x HTTP/1.1\r\n"));

        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let events = conn.recv(wire).unwrap();

        let mut body = Vec::new();
        let mut saw_head = false;
        let mut saw_end = false;
        for event in events {
            match event {
                ClientEvent::ResponseHead(r) => {
                    assert_eq!(r.status, StatusCode::OK);
                    saw_head = true;
                }
                ClientEvent::Body(b) => body.extend_from_slice(&b),
                ClientEvent::End { .. } => saw_end = true,
                ClientEvent::Interim(_) => {}
            }
        }
        assert!(saw_head && saw_end);
        assert_eq!(body, b"hello world");
        assert!(conn.is_reusable());
    }

    #[test]
    fn early_reuse_is_refused_with_busy() {
        let mut conn = connection();
        conn.send_request(&Request::get("h", "/a")).unwrap();
        // Response head arrived but the body has not been consumed.
        conn.recv(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nab").unwrap();
        let err = conn.send_request(&Request::get("h", "/b")).unwrap_err();
        assert_eq!(err, Error::Busy);

        // After the body completes the connection is free again.
        conn.recv(b"cde").unwrap();
        assert!(conn.is_reusable());
        conn.send_request(&Request::get("h", "/b")).unwrap();
    }

    #[test]
    fn connection_close_disables_reuse() {
        let mut conn = connection();
        conn.send_request(&Request::get("h", "/")).unwrap();
        conn.recv(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        assert!(!conn.is_reusable());
    }

    #[test]
    fn truncated_fixed_body_is_an_error() {
        let mut conn = connection();
        conn.send_request(&Request::get("h", "/")).unwrap();
        conn.recv(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc").unwrap();
        assert_eq!(conn.on_eof().unwrap_err(), Error::Truncated);
    }

    #[test]
    fn read_until_close_body_ends_on_eof() {
        let mut conn = connection();
        conn.send_request(&Request::get("h", "/")).unwrap();
        let events = conn.recv(b"HTTP/1.1 200 OK\r\n\r\npartial").unwrap();
        assert!(matches!(events.last(), Some(ClientEvent::Body(_))));
        let events = conn.on_eof().unwrap();
        assert!(matches!(events.last(), Some(ClientEvent::End { .. })));
        assert!(!conn.is_reusable());
    }

    #[test]
    fn expect_continue_withholds_body_until_interim() {
        let mut conn = connection();
        let mut request = Request::get("h", "/upload");
        request.method = Method::Post;
        request.body = BodyLength::Known(4);
        request.headers.try_append(b"expect", "100-continue").unwrap();
        conn.send_request(&request).unwrap();
        conn.send_body(Bytes::from_static(b"data"), true).unwrap();

        // Body is withheld until the interim arrives.
        let sent = conn.poll_output();
        assert!(!String::from_utf8_lossy(&sent).contains("data"));

        let events = conn.recv(b"HTTP/1.1 100 Continue\r\n\r\n").unwrap();
        assert!(matches!(events[0], ClientEvent::Interim(_)));
        assert_eq!(conn.poll_output(), b"data");

        let events = conn.recv(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert!(matches!(events.last(), Some(ClientEvent::End { .. })));
        assert!(conn.is_reusable());
    }

    #[test]
    fn continue_timeout_releases_the_body() {
        let mut conn = connection();
        let mut request = Request::get("h", "/upload");
        request.method = Method::Post;
        request.body = BodyLength::Known(4);
        request.headers.try_append(b"expect", "100-continue").unwrap();
        conn.send_request(&request).unwrap();
        conn.send_body(Bytes::from_static(b"data"), true).unwrap();
        conn.poll_output();

        conn.on_continue_timeout();
        assert_eq!(conn.poll_output(), b"data");
    }
}
