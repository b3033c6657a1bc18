//! HTTP/1.1 server connection engine.

use bytes::{Bytes, BytesMut};

use crate::error::Error;
use crate::http::{BodyLength, FieldSection, Method, Request, Response, Scheme, StatusCode};

use super::body;
use super::chunked::{self, ChunkedDecoder};
use super::encoder;
use super::parser::{self, H1Limits};

/// Events produced by [`ServerConnection::recv`].
#[derive(Debug)]
pub enum ServerEvent {
    /// A complete request head; body events follow.
    RequestHead(Request),
    /// A piece of the request body.
    Body(Bytes),
    /// The request is fully received; the handler response may finish.
    End { trailers: Option<FieldSection> },
}

#[derive(Debug)]
enum ReadState {
    /// Waiting for (more of) a request head.
    Head,
    FixedBody { remaining: u64 },
    ChunkedBody(Box<ChunkedDecoder>),
    /// Request done; the response has not finished yet, so the next
    /// pipelined head stays buffered.
    AwaitingResponse,
    Closed,
}

/// Server-side HTTP/1.1 connection state machine.
#[derive(Debug)]
pub struct ServerConnection {
    limits: H1Limits,
    lenient_lf: bool,
    scheme: Scheme,
    read_buf: BytesMut,
    output: Vec<u8>,
    state: ReadState,
    /// Method of the request being served (HEAD suppresses body).
    method: Option<Method>,
    response_sent: bool,
    response_body: BodyLength,
    response_body_sent: u64,
    response_done: bool,
    close_after: bool,
}

impl ServerConnection {
    #[must_use]
    pub fn new(limits: H1Limits, lenient_lf: bool, scheme: Scheme) -> Self {
        ServerConnection {
            limits,
            lenient_lf,
            scheme,
            read_buf: BytesMut::new(),
            output: Vec::new(),
            state: ReadState::Head,
            method: None,
            response_sent: false,
            response_body: BodyLength::None,
            response_body_sent: 0,
            response_done: true,
            close_after: false,
        }
    }

    /// Consumes transport bytes, producing request events.
    pub fn recv(&mut self, data: &[u8]) -> Result<Vec<ServerEvent>, Error> {
        self.read_buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            match &mut self.state {
                ReadState::Closed => return Err(Error::NetworkClosed),
                ReadState::AwaitingResponse => return Ok(events),
                ReadState::Head => {
                    let parsed = parser::parse_request(&mut self.read_buf, &self.limits, self.lenient_lf);
                    let head = match parsed {
                        Ok(Some(head)) => head,
                        Ok(None) => return Ok(events),
                        Err(e) => {
                            self.reject(&e);
                            return Err(e);
                        }
                    };

                    let authority = match head.headers.get("host") {
                        Some(host) => String::from_utf8_lossy(host.as_bytes()).into_owned(),
                        None => {
                            let e = Error::MalformedMessage("request without host".into());
                            self.reject(&e);
                            return Err(e);
                        }
                    };
                    let length = match body::request_body_length(&head.headers) {
                        Ok(length) => length,
                        Err(e) => {
                            self.reject(&e);
                            return Err(e);
                        }
                    };

                    if head.headers.has_token("connection", "close") {
                        self.close_after = true;
                    }
                    // The interim 100 goes out before the handler ever
                    // sees the body.
                    if head.headers.has_token("expect", "100-continue")
                        && !matches!(length, BodyLength::None)
                    {
                        self.output.extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
                    }

                    self.method = Some(head.method.clone());
                    self.response_sent = false;
                    self.response_done = false;

                    let request = Request {
                        method: head.method,
                        target: head.target,
                        scheme: self.scheme,
                        authority,
                        headers: head.headers,
                        trailers: FieldSection::new(),
                        body: length,
                    };
                    events.push(ServerEvent::RequestHead(request));

                    match length {
                        BodyLength::None | BodyLength::Known(0) => {
                            events.push(ServerEvent::End { trailers: None });
                            self.request_complete();
                        }
                        BodyLength::Known(n) => self.state = ReadState::FixedBody { remaining: n },
                        BodyLength::Chunked => {
                            self.state =
                                ReadState::ChunkedBody(Box::new(ChunkedDecoder::new(self.limits)));
                        }
                        BodyLength::UntilClose => {
                            // Requests cannot be close-delimited.
                            let e = Error::BadFraming("request body without length".into());
                            self.reject(&e);
                            return Err(e);
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
                    events.push(ServerEvent::Body(self.read_buf.split_to(take).freeze()));
                    if *remaining == 0 {
                        events.push(ServerEvent::End { trailers: None });
                        self.request_complete();
                    }
                }
                ReadState::ChunkedBody(decoder) => {
                    let progress = match decoder.feed(&mut self.read_buf) {
                        Ok(progress) => progress,
                        Err(e) => {
                            self.reject(&e);
                            return Err(e);
                        }
                    };
                    let finished = progress.finished;
                    let trailers = finished.then(|| decoder.take_trailers()).flatten();
                    for data in progress.data {
                        events.push(ServerEvent::Body(data));
                    }
                    if finished {
                        events.push(ServerEvent::End { trailers });
                        self.request_complete();
                    } else {
                        return Ok(events);
                    }
                }
            }
        }
    }

    /// Sends the response head. A second final response on the same
    /// exchange is refused: the engine guarantees exactly one.
    pub fn send_response(&mut self, response: &Response) -> Result<(), Error> {
        if matches!(self.state, ReadState::Closed) {
            return Err(Error::NetworkClosed);
        }
        if self.response_sent {
            return Err(Error::MalformedMessage("response already sent".into()));
        }

        encoder::encode_response(response, &mut self.output)?;
        if response.status.is_informational() {
            return Ok(());
        }

        self.response_sent = true;
        self.response_body = response.body;
        self.response_body_sent = 0;
        if response.headers.has_token("connection", "close") {
            self.close_after = true;
        }

        let head_only = self.method == Some(Method::Head)
            || matches!(response.body, BodyLength::None | BodyLength::Known(0));
        if head_only {
            self.finish_response();
        }
        Ok(())
    }

    /// Sends a piece of the response body.
    ///
    /// Writing fewer `Known` bytes than declared aborts the connection
    /// when `end` arrives; writing more is refused immediately.
    pub fn send_body(&mut self, data: Bytes, end: bool) -> Result<(), Error> {
        if !self.response_sent || self.response_done {
            return Err(Error::MalformedMessage("no response body in progress".into()));
        }
        // HEAD responses carry framing headers but no body bytes.
        if self.method == Some(Method::Head) {
            if end {
                self.finish_response();
            }
            return Ok(());
        }

        match self.response_body {
            BodyLength::Known(declared) => {
                self.response_body_sent += data.len() as u64;
                if self.response_body_sent > declared {
                    self.abort();
                    return Err(Error::BadFraming("response body exceeds content-length".into()));
                }
                self.output.extend_from_slice(&data);
                if end {
                    if self.response_body_sent != declared {
                        // Short body: the peer would wait forever, so
                        // the connection is torn down.
                        self.abort();
                        return Err(Error::BadFraming(
                            "response body shorter than content-length".into(),
                        ));
                    }
                    self.finish_response();
                }
            }
            BodyLength::Chunked => {
                if !data.is_empty() {
                    chunked::encode_chunk(&data, &mut self.output);
                }
                if end {
                    chunked::encode_terminator(None, &mut self.output);
                    self.finish_response();
                }
            }
            BodyLength::UntilClose => {
                self.output.extend_from_slice(&data);
                if end {
                    self.close_after = true;
                    self.finish_response();
                }
            }
            BodyLength::None => {
                if !data.is_empty() {
                    return Err(Error::BadFraming("body bytes on a bodiless response".into()));
                }
                if end {
                    self.finish_response();
                }
            }
        }
        Ok(())
    }

    /// Synthesizes the 500 the handler contract requires when a
    /// handler finished without producing a response.
    pub fn respond_500_if_unsent(&mut self) -> Result<(), Error> {
        if self.response_sent {
            return Ok(());
        }
        tracing::warn!(target: "trireme::h1::server", "handler returned without a response, synthesizing 500");
        self.send_response(&Response::internal_error())
    }

    /// The transport reported EOF.
    pub fn on_eof(&mut self) -> Result<(), Error> {
        let mid_request = matches!(
            self.state,
            ReadState::FixedBody { .. } | ReadState::ChunkedBody(_)
        ) || (matches!(self.state, ReadState::Head) && !self.read_buf.is_empty());
        self.state = ReadState::Closed;
        if mid_request {
            Err(Error::NetworkClosed)
        } else {
            Ok(())
        }
    }

    /// A caller-enforced deadline expired mid-exchange.
    pub fn on_timeout(&mut self) {
        if !matches!(self.state, ReadState::Closed) && !self.response_sent {
            let mut response = Response::new(StatusCode::REQUEST_TIMEOUT);
            response.body = BodyLength::Known(0);
            response.headers.try_append(b"connection", "close").ok();
            let _ = self.send_response(&response);
        }
        self.state = ReadState::Closed;
    }

    /// Bytes the engine wants written to the transport.
    pub fn poll_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// True once the engine has decided the connection must close
    /// after the current response.
    #[must_use]
    pub fn will_close(&self) -> bool {
        self.close_after || matches!(self.state, ReadState::Closed)
    }

    fn finish_response(&mut self) {
        self.response_done = true;
        if self.close_after {
            self.state = ReadState::Closed;
            return;
        }
        if matches!(self.state, ReadState::AwaitingResponse) {
            // Exchange complete in both directions: ready for the next
            // request, which may already be buffered.
            self.state = ReadState::Head;
            self.method = None;
        }
    }

    /// The request side finished; if the response already did too, the
    /// connection is ready for the next exchange.
    fn request_complete(&mut self) {
        self.state = ReadState::AwaitingResponse;
        if self.response_done && !self.close_after {
            self.state = ReadState::Head;
            self.method = None;
        }
    }

    /// Best-effort 400-style rejection before closing.
    fn reject(&mut self, error: &Error) {
        let status = match error {
            Error::TooLarge(_) => StatusCode::new(431).unwrap_or(StatusCode::BAD_REQUEST),
            Error::UnsupportedVersion(_) => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            _ => StatusCode::BAD_REQUEST,
        };
        if !self.response_sent {
            let mut response = Response::new(status);
            response.body = BodyLength::Known(0);
            response.headers.try_append(b"connection", "close").ok();
            let _ = encoder::encode_response(&response, &mut self.output);
        }
        self.state = ReadState::Closed;
    }

    fn abort(&mut self) {
        self.state = ReadState::Closed;
        self.close_after = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ServerConnection {
        ServerConnection::new(H1Limits::default(), false, Scheme::Https)
    }

    #[test]
    fn serves_a_get_and_reuses_the_connection() {
        let mut conn = connection();
        let events = conn.recv(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        let ServerEvent::RequestHead(request) = &events[0] else {
            panic!("expected request head");
        };
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.authority, "h");
        assert!(matches!(events[1], ServerEvent::End { .. }));

        let mut response = Response::new(StatusCode::OK);
        response.body = BodyLength::Known(2);
        conn.send_response(&response).unwrap();
        conn.send_body(Bytes::from_static(b"ok"), true).unwrap();
        assert!(!conn.will_close());

        let out = conn.poll_output();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));

        // Next request on the same connection parses normally.
        let events = conn.recv(b"GET /y HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert!(matches!(events[0], ServerEvent::RequestHead(_)));
    }

    #[test]
    fn pipelined_request_waits_for_the_response() {
        let mut conn = connection();
        let both = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
        let events = conn.recv(both).unwrap();
        // Only the first request is surfaced.
        assert_eq!(
            events.iter().filter(|e| matches!(e, ServerEvent::RequestHead(_))).count(),
            1
        );

        let mut response = Response::new(StatusCode::OK);
        response.body = BodyLength::Known(0);
        conn.send_response(&response).unwrap();

        // The buffered second request surfaces without new input.
        let events = conn.recv(b"").unwrap();
        assert_eq!(
            events.iter().filter(|e| matches!(e, ServerEvent::RequestHead(_))).count(),
            1
        );
    }

    #[test]
    fn expect_continue_gets_an_interim_before_body() {
        let mut conn = connection();
        conn.recv(b"POST /u HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\nExpect: 100-continue\r\n\r\n")
            .unwrap();
        let out = conn.poll_output();
        assert_eq!(out, b"HTTP/1.1 100 Continue\r\n\r\n");

        let events = conn.recv(b"data").unwrap();
        assert!(matches!(events.last(), Some(ServerEvent::End { .. })));
    }

    #[test]
    fn missing_host_is_rejected() {
        let mut conn = connection();
        let err = conn.recv(b"GET / HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
        let out = conn.poll_output();
        assert!(String::from_utf8_lossy(&out).starts_with("HTTP/1.1 400"));
    }

    #[test]
    fn short_response_body_aborts() {
        let mut conn = connection();
        conn.recv(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        let mut response = Response::new(StatusCode::OK);
        response.body = BodyLength::Known(10);
        conn.send_response(&response).unwrap();
        let err = conn.send_body(Bytes::from_static(b"abc"), true).unwrap_err();
        assert!(matches!(err, Error::BadFraming(_)));
        assert!(conn.will_close());
    }

    #[test]
    fn second_response_is_refused() {
        let mut conn = connection();
        conn.recv(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        let mut response = Response::new(StatusCode::OK);
        response.body = BodyLength::Known(0);
        conn.send_response(&response).unwrap();
        assert!(conn.send_response(&response).is_err());
    }

    #[test]
    fn synthesized_500_when_handler_stays_silent() {
        let mut conn = connection();
        conn.recv(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        conn.respond_500_if_unsent().unwrap();
        let out = conn.poll_output();
        assert!(String::from_utf8_lossy(&out).starts_with("HTTP/1.1 500"));
    }

    #[test]
    fn head_response_suppresses_body_bytes() {
        let mut conn = connection();
        conn.recv(b"HEAD / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        let mut response = Response::new(StatusCode::OK);
        response.body = BodyLength::Known(5);
        conn.send_response(&response).unwrap();
        conn.send_body(Bytes::from_static(b"hello"), true).unwrap();
        let text = String::from_utf8(conn.poll_output()).unwrap();
        assert!(text.contains("content-length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
