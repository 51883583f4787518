mod support;

use support::*;

use h2core::server::{Builder, Event, RequestHead};
use h2core::Reason;
use http::{Method, StatusCode};

fn stream_posts(head: &RequestHead) -> bool {
    head.method == Method::POST
}

fn streaming_builder() -> Builder {
    let mut builder = Builder::new();
    builder.request_streaming(stream_posts);
    builder
}

/// CONNECT opens a bidirectional tunnel: dispatched immediately, body bytes
/// relayed in both directions, torn down by RST_STREAM.
#[test]
fn connect_tunnel() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut peer = Peer::connected(&Builder::new());

    peer.send_headers(1, &[(":method", "CONNECT"), (":authority", "db.example.com:5432")], 0);

    let events = peer.poll_events();
    match &events[..] {
        [Event::Request {
            id,
            head,
            streaming,
            ..
        }] => {
            assert_eq!(*id, sid(1));
            assert_eq!(head.method, Method::CONNECT);
            assert_eq!(&head.authority[..], b"db.example.com:5432");
            assert!(*streaming);
        }
        other => panic!("unexpected events: {:?}", other),
    }
    assert_eq!(peer.conn.stats().tunnels, 1);
    assert_eq!(peer.conn.stats().streaming, 1);

    // Upstream bytes flow out as body chunks...
    peer.send_data(1, b"SELECT 1", false);
    let events = peer.poll_events();
    match &events[..] {
        [Event::RequestBody { id, data, is_end }] => {
            assert_eq!(*id, sid(1));
            assert_eq!(&data[..], b"SELECT 1");
            assert!(!is_end);
        }
        other => panic!("unexpected events: {:?}", other),
    }
    peer.conn.proceed_request(sid(1)).unwrap();

    // ...and downstream bytes as DATA frames.
    peer.conn
        .send_response(sid(1), StatusCode::OK, Default::default(), false)
        .unwrap();
    peer.conn.send_data(sid(1), "one row".into(), false).unwrap();
    let frames = peer.drain_writes();
    assert!(frames.contains(&TestFrame::Data {
        id: 1,
        end_stream: false,
        payload: b"one row".to_vec(),
    }));

    // Peer reset tears the tunnel down and releases the slot.
    peer.poll_events();
    peer.send(&rst_stream_frame(1, Reason::CANCEL.into()));
    let events = peer.poll_events();
    assert!(events.iter().any(|e| matches!(e, Event::Reset { .. })));
    assert_eq!(peer.conn.stats().tunnels, 0);
    assert_eq!(peer.conn.stats().streaming, 0);
}

/// CONNECT with a content-length (or an immediate END_STREAM) is not a
/// tunnel; it gets a 400 response, not a reset.
#[test]
fn connect_with_content_length_gets_400() {
    let mut peer = Peer::connected(&Builder::new());

    peer.send_headers(
        1,
        &[
            (":method", "CONNECT"),
            (":authority", "db.example.com:5432"),
            ("content-length", "10"),
        ],
        0,
    );

    let frames = peer.drain_writes();
    match &frames[..] {
        [TestFrame::Headers {
            id, end_stream, fields,
        }, TestFrame::Data { .. }] => {
            assert_eq!(*id, 1);
            assert!(!end_stream);
            assert_eq!(fields[0], (":status".to_string(), "400".to_string()));
        }
        other => panic!("unexpected frames: {:?}", other),
    }
    assert!(peer.poll_events().is_empty());
}

/// A streamed request: elected on the first DATA frame, chunks delivered
/// with proceed-based back-pressure, window expanded for runway.
#[test]
fn streamed_request_body_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut peer = Peer::connected(&streaming_builder());

    let mut headers = get_headers("/ingest");
    headers[0] = (":method", "POST");
    peer.send_headers(1, &headers, 0);
    peer.send_data(1, b"hello", false);

    let events = peer.poll_events();
    match &events[..] {
        [Event::Request { id, streaming, body, .. }, Event::RequestBody { data, is_end, .. }] => {
            assert_eq!(*id, sid(1));
            assert!(*streaming);
            assert!(body.is_empty());
            assert_eq!(&data[..], b"hello");
            assert!(!is_end);
        }
        other => panic!("unexpected events: {:?}", other),
    }
    assert_eq!(peer.conn.stats().streaming, 1);

    // The stream's receive window was grown to the active window size.
    let frames = peer.drain_writes();
    assert!(frames.contains(&TestFrame::WindowUpdate {
        id: 1,
        increment: 16 * 1024 * 1024 - 65_535,
    }));

    // More data arrives while the first chunk is unacknowledged: held back.
    peer.send_data(1, b" wor", false);
    peer.send_data(1, b"ld", true);
    assert!(peer.poll_events().is_empty());

    // Acknowledging releases the buffered remainder as the final chunk.
    peer.conn.proceed_request(sid(1)).unwrap();
    let events = peer.poll_events();
    match &events[..] {
        [Event::RequestBody { data, is_end, .. }] => {
            assert_eq!(&data[..], b" world");
            assert!(*is_end);
        }
        other => panic!("unexpected events: {:?}", other),
    }
    assert_eq!(peer.conn.stats().streaming, 0);

    // The response closes the stream.
    peer.conn
        .send_response(sid(1), StatusCode::OK, Default::default(), false)
        .unwrap();
    peer.conn.send_data(sid(1), "ack".into(), true).unwrap();
    peer.drain_writes();
    assert_eq!(peer.conn.stats().pull_open, 0);
}

/// Only the configured number of streamed bodies runs at once; the rest
/// keep their place in the pending queue until a slot frees up.
#[test]
fn streaming_admission_limit_is_enforced() {
    let mut peer = Peer::connected(&streaming_builder());

    let mut headers = get_headers("/a");
    headers[0] = (":method", "POST");
    peer.send_headers(1, &headers, 0);
    peer.send_data(1, b"first", false);
    assert_eq!(peer.poll_events().len(), 2);

    // Second streamed request has to wait for the slot.
    let mut headers = get_headers("/b");
    headers[0] = (":method", "POST");
    peer.send_headers(3, &headers, 0);
    peer.send_data(3, b"second", false);
    assert!(peer.poll_events().is_empty());

    // Finish the first request.
    peer.conn.proceed_request(sid(1)).unwrap();
    peer.send_data(1, b"", true);
    let events = peer.poll_events();
    assert!(matches!(
        &events[..],
        [Event::RequestBody { is_end: true, .. }]
    ));
    peer.conn
        .send_response(sid(1), StatusCode::OK, Default::default(), true)
        .unwrap();
    peer.drain_writes();

    // The slot freed; stream 3 is dispatched with its buffered chunk.
    let events = peer.poll_events();
    match &events[..] {
        [Event::Request { id, streaming, .. }, Event::RequestBody { data, .. }] => {
            assert_eq!(*id, sid(3));
            assert!(*streaming);
            assert_eq!(&data[..], b"second");
        }
        other => panic!("unexpected events: {:?}", other),
    }
}

/// `abort_request` answers the stream with RST_STREAM(STREAM_CLOSED) and
/// releases all streaming accounting.
#[test]
fn abort_request_resets_the_stream() {
    let mut peer = Peer::connected(&streaming_builder());

    let mut headers = get_headers("/ingest");
    headers[0] = (":method", "POST");
    peer.send_headers(1, &headers, 0);
    peer.send_data(1, b"doomed", false);
    peer.poll_events();

    peer.conn.abort_request(sid(1)).unwrap();

    let frames = peer.drain_writes();
    assert!(frames.contains(&TestFrame::Reset {
        id: 1,
        reason: Reason::STREAM_CLOSED,
    }));
    assert_eq!(peer.conn.stats().streaming, 0);
    assert_eq!(peer.conn.stats().pull_open, 0);
}

/// A body that completes before the streaming dispatch falls back to the
/// buffered path: one Request event carrying the whole entity.
#[test]
fn body_completing_before_dispatch_is_buffered() {
    let mut builder = streaming_builder();
    builder.max_concurrent_streaming_requests(0);
    let mut peer = Peer::connected(&builder);

    let mut headers = get_headers("/ingest");
    headers[0] = (":method", "POST");
    peer.send_headers(1, &headers, 0);

    // Elected for streaming, but no slot is ever available...
    peer.send_data(1, b"all at ", false);
    assert!(peer.poll_events().is_empty());

    // ...so when the body completes, the election lapses.
    peer.send_data(1, b"once", true);
    let events = peer.poll_events();
    match &events[..] {
        [Event::Request { body, streaming, .. }] => {
            assert_eq!(&body[..], b"all at once");
            assert!(!streaming);
        }
        other => panic!("unexpected events: {:?}", other),
    }
}
