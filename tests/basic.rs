//! End-to-end scenarios spanning the whole pipeline: two `Endpoint`s
//! wired directly together (no real transport), bytes handed from one's
//! `poll_outbound` into the other's `feed`.

use bytes::Bytes;
use h2_core::{ConnectionEvent, Endpoint, ErrorCode, Role, Settings, StreamNotification};
use maplit::hashmap;

fn pump(from: &Endpoint, to: &Endpoint) {
    while let Some(bytes) = from.poll_outbound() {
        to.feed(&bytes).unwrap();
    }
}

fn handshake(client: &Endpoint, server: &Endpoint) {
    server.feed(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").unwrap();
    pump(client, server);
    pump(server, client);
}

fn headers_vec(map: std::collections::HashMap<&str, &str>) -> Vec<(String, String)> {
    map.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn has_pair(headers: &[(String, String)], name: &str, value: &str) -> bool {
    headers.iter().any(|(n, v)| n == name && v == value)
}

#[test]
fn request_then_response_round_trip() {
    let client = Endpoint::new(Role::Client, Settings::default());
    let server = Endpoint::new(Role::Server, Settings::default());
    handshake(&client, &server);

    let request = client
        .create_stream(None)
        .expect("first client stream should always be admitted");
    request.headers(
        headers_vec(hashmap! {
            ":method" => "get",
            ":scheme" => "https",
            ":host" => "example.invalid",
            ":path" => "/",
        }),
        None,
        true,
    );
    pump(&client, &server);

    let ConnectionEvent::IncomingStream(id) = server.poll_event().unwrap() else {
        panic!("server should observe the new stream");
    };
    let mut response = server.accept_stream(id).unwrap();
    response.headers(headers_vec(hashmap! { ":status" => "200" }), None, false);
    response.write(Bytes::from_static(b"hello"));
    response.end();
    pump(&server, &client);

    let mut request = request;
    let mut received_headers = None;
    let mut received_body = Vec::new();
    while let Some(notification) = request.poll_notification() {
        match notification {
            StreamNotification::Headers(headers) => received_headers = Some(headers),
            StreamNotification::Data(bytes) => received_body.extend_from_slice(&bytes),
            _ => {}
        }
    }
    let received_headers = received_headers.expect("response headers should have arrived");
    assert!(has_pair(&received_headers, ":status", "200"));
    assert_eq!(received_body, b"hello");
}

#[test]
fn server_push_is_observed_by_the_client() {
    let client = Endpoint::new(Role::Client, Settings::default());
    let server = Endpoint::new(Role::Server, Settings::default());
    handshake(&client, &server);

    let request = client.create_stream(None).unwrap();
    request.headers(headers_vec(hashmap! { ":method" => "get" }), None, true);
    pump(&client, &server);

    let ConnectionEvent::IncomingStream(req_id) = server.poll_event().unwrap() else {
        panic!("wrong event")
    };
    let main_response = server.accept_stream(req_id).unwrap();
    let pushed = main_response
        .promise(headers_vec(hashmap! { ":path" => "/style.css" }))
        .expect("pushing a stream on an active carrier should succeed");
    main_response.headers(headers_vec(hashmap! { ":status" => "200" }), None, false);
    main_response.end();
    pushed.headers(headers_vec(hashmap! { ":status" => "200" }), None, false);
    pushed.write(Bytes::from_static(b"body {}"));
    pushed.end();
    pump(&server, &client);

    let mut saw_push = false;
    while let Some(event) = client.poll_event() {
        if matches!(event, ConnectionEvent::IncomingStream(id) if id == pushed.id()) {
            saw_push = true;
        }
    }
    assert!(saw_push, "client should see an IncomingStream event for the pushed ID");

    let mut pushed_on_client = client.accept_stream(pushed.id()).unwrap();
    let mut body = Vec::new();
    while let Some(notification) = pushed_on_client.poll_notification() {
        if let StreamNotification::Data(bytes) = notification {
            body.extend_from_slice(&bytes);
        }
    }
    assert_eq!(body, b"body {}");
}

#[test]
fn reset_stream_drops_queued_output_and_surfaces_an_error() {
    let client = Endpoint::new(Role::Client, Settings::default());
    let server = Endpoint::new(Role::Server, Settings::default());
    handshake(&client, &server);

    let request = client.create_stream(None).unwrap();
    request.headers(headers_vec(hashmap! { ":method" => "get" }), None, false);
    pump(&client, &server);
    let ConnectionEvent::IncomingStream(id) = server.poll_event().unwrap() else {
        panic!("wrong event")
    };
    let remote = server.accept_stream(id).unwrap();
    assert_eq!(remote.state(), Some(h2_core::StreamState::Open));

    // Queue a write, then cancel before it ever reaches the wire: only the
    // RST_STREAM should cross, never the body.
    request.write(Bytes::from_static(b"body the peer must never see"));
    request.reset(ErrorCode::Cancel);
    pump(&client, &server);

    // The server-side stream never had any outbound frames queued, so once
    // RST_STREAM closes it, it is immediately drained and reaped from the
    // registry rather than lingering as an empty CLOSED entry.
    assert_eq!(remote.state(), None);
}

#[tokio::test]
async fn ping_future_resolves_once_the_peer_echoes_it() {
    let client = Endpoint::new(Role::Client, Settings::default());
    let server = Endpoint::new(Role::Server, Settings::default());
    handshake(&client, &server);

    let pong = client.ping(*b"deadbeef");
    pump(&client, &server);
    pump(&server, &client);

    tokio::time::timeout(std::time::Duration::from_secs(1), pong)
        .await
        .expect("ping should resolve well before the timeout")
        .expect("the oneshot sender should not have been dropped");
}

#[test]
fn goaway_is_observed_by_the_peer() {
    let client = Endpoint::new(Role::Client, Settings::default());
    let server = Endpoint::new(Role::Server, Settings::default());
    handshake(&client, &server);

    let request = client.create_stream(None).unwrap();
    server.goaway(0, ErrorCode::NoError);
    pump(&server, &client);

    let mut saw_goaway = false;
    while let Some(event) = client.poll_event() {
        if matches!(event, ConnectionEvent::PeerGoingAway { .. }) {
            saw_goaway = true;
        }
    }
    assert!(saw_goaway);
    drop(request);
}
