//! End-to-end HTTP/3 over an in-memory QUIC stand-in: per-stream
//! byte shuttling with deliberate reordering to exercise QPACK
//! blocking.

use bytes::Bytes;
use trireme::config::H3Config;
use trireme::http::{Method, Request, Response, StatusCode};
use trireme::protocols::h3::{Event, H3Connection};
use trireme::protocols::message::PeerHead;

fn pair() -> (H3Connection, H3Connection) {
    let config = H3Config::default();
    let mut client = H3Connection::new_client(&config);
    let mut server = H3Connection::new_server(&config);
    // QUIC id plan: client uni streams 2/6/10, server uni 3/7/11.
    client.set_local_uni_streams(2, 6, 10);
    server.set_local_uni_streams(3, 7, 11);
    shuttle(&mut client, &mut server);
    (client, server)
}

fn shuttle(client: &mut H3Connection, server: &mut H3Connection) -> Vec<Event> {
    let mut events = Vec::new();
    for _ in 0..16 {
        let mut quiet = true;
        for t in client.poll_transmit() {
            quiet = false;
            events.extend(server.recv_stream(t.stream_id, &t.data, t.fin).unwrap());
        }
        for t in server.poll_transmit() {
            quiet = false;
            events.extend(client.recv_stream(t.stream_id, &t.data, t.fin).unwrap());
        }
        if quiet {
            break;
        }
    }
    events
}

#[test]
fn request_and_response_round_trip() {
    let (mut client, mut server) = pair();

    let mut request = Request::get("example.com", "/items");
    request.method = Method::Post;
    let stream_id = client.open_request(&request, false).unwrap();
    client.send_body(stream_id, Bytes::from_static(b"payload"), true).unwrap();

    let events = shuttle(&mut client, &mut server);
    let mut body = Vec::new();
    let mut seen_head = false;
    let mut finished = false;
    for event in &events {
        match event {
            Event::Headers { head: PeerHead::Request(r), .. } => {
                assert_eq!(r.method, Method::Post);
                assert_eq!(r.authority, "example.com");
                seen_head = true;
            }
            Event::Data { data, .. } => body.extend_from_slice(data),
            Event::Finished { .. } => finished = true,
            _ => {}
        }
    }
    assert!(seen_head && finished);
    assert_eq!(body, b"payload");

    let mut response = Response::new(StatusCode::OK);
    response.headers.try_append(b"x-served-by", "engine-a").unwrap();
    server.send_response(stream_id, &response, false).unwrap();
    server.send_body(stream_id, Bytes::from_static(b"done"), true).unwrap();

    let events = shuttle(&mut client, &mut server);
    let mut status = None;
    let mut body = Vec::new();
    for event in &events {
        match event {
            Event::Headers { head: PeerHead::Response(r), .. } => status = Some(r.status),
            Event::Data { data, .. } => body.extend_from_slice(data),
            _ => {}
        }
    }
    assert_eq!(status, Some(StatusCode::OK));
    assert_eq!(body, b"done");
}

#[test]
fn header_block_blocks_until_encoder_stream_arrives() {
    let (mut client, mut server) = pair();

    // A header the static table cannot cover forces a dynamic-table
    // insertion on the encoder stream.
    let mut request = Request::get("example.com", "/blocked");
    request.headers.try_append(b"x-tenant", "blue-7").unwrap();
    let stream_id = client.open_request(&request, true).unwrap();

    let transmits = client.poll_transmit();
    let request_stream = transmits
        .iter()
        .find(|t| t.stream_id == stream_id)
        .expect("request bytes");
    let encoder_stream = transmits
        .iter()
        .find(|t| t.stream_id == 6)
        .expect("encoder stream bytes");

    // Deliver the request stream first: the head cannot decode yet and
    // nothing surfaces.
    let events = server
        .recv_stream(request_stream.stream_id, &request_stream.data, request_stream.fin)
        .unwrap();
    assert!(!events.iter().any(|e| matches!(e, Event::Headers { .. })));

    // Once the insertion arrives the head decodes and the decoder
    // stream acknowledges.
    let events = server
        .recv_stream(encoder_stream.stream_id, &encoder_stream.data, encoder_stream.fin)
        .unwrap();
    let head = events.iter().find_map(|e| match e {
        Event::Headers { head: PeerHead::Request(r), .. } => Some(r.clone()),
        _ => None,
    });
    let head = head.expect("unblocked head");
    assert_eq!(head.headers.get("x-tenant").unwrap().as_bytes(), b"blue-7");

    // Acknowledgments flow back on the server's decoder stream (11).
    let feedback = server.poll_transmit();
    assert!(feedback.iter().any(|t| t.stream_id == 11 && !t.data.is_empty()));
    for t in feedback {
        client.recv_stream(t.stream_id, &t.data, t.fin).unwrap();
    }
}

#[test]
fn second_request_reuses_the_dynamic_table() {
    let (mut client, mut server) = pair();

    let mut request = Request::get("example.com", "/a");
    request.headers.try_append(b"x-custom-token", "alpha-beta-gamma").unwrap();
    client.open_request(&request, true).unwrap();
    shuttle(&mut client, &mut server);

    // The second section should be materially smaller: the custom
    // field is a single dynamic-table reference now.
    let mut request2 = Request::get("example.com", "/a");
    request2.headers.try_append(b"x-custom-token", "alpha-beta-gamma").unwrap();
    let stream_id = client.open_request(&request2, true).unwrap();
    let transmits = client.poll_transmit();
    let request_bytes = transmits
        .iter()
        .find(|t| t.stream_id == stream_id)
        .map(|t| t.data.len())
        .unwrap();
    assert!(request_bytes < 40, "expected compact section, got {request_bytes}");

    for t in transmits {
        server.recv_stream(t.stream_id, &t.data, t.fin).unwrap();
    }
}
