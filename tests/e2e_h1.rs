//! End-to-end HTTP/1.1 exchanges: a client engine wired to a server
//! engine through in-memory byte shuttling.

use bytes::Bytes;
use trireme::config::H1Config;
use trireme::http::{BodyLength, Method, Request, Response, Scheme, StatusCode};
use trireme::protocols::h1::{ClientConnection, ClientEvent, ServerConnection, ServerEvent};

fn client() -> ClientConnection {
    let config = H1Config::default();
    ClientConnection::new(config.limits, config.lenient_lf)
}

fn server() -> ServerConnection {
    let config = H1Config::default();
    ServerConnection::new(config.limits, config.lenient_lf, Scheme::Https)
}

#[test]
fn chunked_get_round_trip_and_reuse() {
    let mut client = client();
    let mut server = server();

    let mut request = Request::get("h", "/x");
    request.scheme = Scheme::Https;
    client.send_request(&request).unwrap();

    let events = server.recv(&client.poll_output()).unwrap();
    let ServerEvent::RequestHead(received) = &events[0] else {
        panic!("expected a request head");
    };
    assert_eq!(received.method, Method::Get);
    assert_eq!(received.target, "/x");
    assert_eq!(received.authority, "h");

    let mut response = Response::new(StatusCode::OK);
    response.body = BodyLength::Chunked;
    server.send_response(&response).unwrap();
    server.send_body(Bytes::from_static(b"hello"), false).unwrap();
    server.send_body(Bytes::from_static(b" world"), false).unwrap();
    server.send_body(Bytes::new(), true).unwrap();

    let wire = server.poll_output();
    let text = String::from_utf8_lossy(&wire);
    assert!(text.contains("transfer-encoding: chunked"));
    assert!(text.contains("5\r\nhello\r\n"));

    let events = client.recv(&wire).unwrap();
    let mut body = Vec::new();
    let mut done = false;
    for event in events {
        match event {
            ClientEvent::ResponseHead(head) => assert_eq!(head.status, StatusCode::OK),
            ClientEvent::Body(chunk) => body.extend_from_slice(&chunk),
            ClientEvent::End { .. } => done = true,
            ClientEvent::Interim(_) => {}
        }
    }
    assert!(done);
    assert_eq!(body, b"hello world");

    // The connection goes back to the pool and carries another
    // request.
    assert!(client.is_reusable());
    client.send_request(&Request::get("h", "/second")).unwrap();
}

#[test]
fn sending_before_the_body_is_consumed_is_busy() {
    let mut client = client();
    client.send_request(&Request::get("h", "/a")).unwrap();
    client
        .recv(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nab")
        .unwrap();

    let err = client.send_request(&Request::get("h", "/b")).unwrap_err();
    assert_eq!(err, trireme::Error::Busy);

    client.recv(b"cd").unwrap();
    client.send_request(&Request::get("h", "/b")).unwrap();
}

#[test]
fn expect_continue_flows_end_to_end() {
    let mut client = client();
    let mut server = server();

    let mut request = Request::get("h", "/upload");
    request.method = Method::Post;
    request.body = BodyLength::Known(4);
    request.headers.try_append(b"expect", "100-continue").unwrap();
    client.send_request(&request).unwrap();
    client.send_body(Bytes::from_static(b"data"), true).unwrap();

    // Headers travel; the body is withheld.
    let first = client.poll_output();
    assert!(!String::from_utf8_lossy(&first).contains("data"));
    server.recv(&first).unwrap();

    // The server engine answers 100 Continue on its own.
    let interim = server.poll_output();
    assert!(String::from_utf8_lossy(&interim).starts_with("HTTP/1.1 100 Continue"));
    let events = client.recv(&interim).unwrap();
    assert!(matches!(events[0], ClientEvent::Interim(_)));

    // Now the body flows and the exchange completes.
    let body_bytes = client.poll_output();
    assert_eq!(body_bytes, b"data");
    let events = server.recv(&body_bytes).unwrap();
    assert!(matches!(events.last(), Some(ServerEvent::End { .. })));

    let mut response = Response::new(StatusCode::OK);
    response.body = BodyLength::Known(0);
    server.send_response(&response).unwrap();
    let events = client.recv(&server.poll_output()).unwrap();
    assert!(matches!(events.last(), Some(ClientEvent::End { .. })));
    assert!(client.is_reusable());
}

#[test]
fn truncated_response_surfaces_as_truncated() {
    let mut client = client();
    client.send_request(&Request::get("h", "/")).unwrap();
    client
        .recv(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nshort")
        .unwrap();
    assert_eq!(client.on_eof().unwrap_err(), trireme::Error::Truncated);
}

#[test]
fn trailers_arrive_after_chunked_body() {
    let mut client = client();
    client.send_request(&Request::get("h", "/t")).unwrap();
    let events = client
        .recv(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\nx-digest: abc\r\n\r\n")
        .unwrap();
    let Some(ClientEvent::End { trailers: Some(trailers) }) = events.last() else {
        panic!("expected trailers");
    };
    assert_eq!(trailers.get("x-digest").unwrap().as_bytes(), b"abc");
}
