// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Connection lifecycle: keep-alive reuse, arena reset between
//! requests, pipelining, `Connection: close`, malformed input and
//! connection takeover.

use ecewo::{connection_takeover, status, TakeoverConfig};

mod common;

#[test]
fn lifecycle() {
    let server = common::start_server(|server| {
        server.get("/greet", |req, res| {
            // Echo a request header back so cross-request leakage would
            // be visible.
            let tag = req.header("X-Tag").unwrap_or("none").to_owned();
            res.set_header("X-Seen", &tag);
            res.send_text(status::OK, format!("tag={tag}"));
        });

        server.post("/echo", |req, res| {
            let body = req.body_str().unwrap_or("NULL").to_owned();
            res.send_text(status::OK, body);
        });

        server.get("/upgrade", |_req, res| {
            let taken = connection_takeover(
                res,
                TakeoverConfig {
                    on_data: Some(Box::new(|conn, data| {
                        // Echo protocol: mirror every frame back.
                        let mut reply = b"echo:".to_vec();
                        reply.extend_from_slice(data);
                        conn.send(&reply);
                    })),
                },
            )
            .expect("takeover");
            taken.send(b"HELLO\n");
        });
    });

    keep_alive_reuses_the_connection(&server);
    headers_do_not_leak_between_requests(&server);
    pipelined_requests_are_served_in_order(&server);
    connection_close_is_honored(&server);
    malformed_request_is_400_close(&server);
    takeover_detaches_http(&server);
}

fn keep_alive_reuses_the_connection(server: &common::RunningServer) {
    let mut client = server.connect();

    client.send(b"GET /greet HTTP/1.1\r\nHost: t\r\nX-Tag: one\r\n\r\n");
    let first = client.read_response();
    assert_eq!(first.status, 200);
    assert_eq!(first.body_str(), "tag=one");
    assert_eq!(first.header("connection"), Some("keep-alive"));

    client.send(b"GET /greet HTTP/1.1\r\nHost: t\r\nX-Tag: two\r\n\r\n");
    let second = client.read_response();
    assert_eq!(second.status, 200);
    assert_eq!(second.body_str(), "tag=two");
}

fn headers_do_not_leak_between_requests(server: &common::RunningServer) {
    let mut client = server.connect();

    client.send(b"GET /greet HTTP/1.1\r\nHost: t\r\nX-Tag: sticky\r\n\r\n");
    let first = client.read_response();
    assert_eq!(first.header("x-seen"), Some("sticky"));

    // Second request does not send the header; the arena was reset, so
    // nothing from the first request may bleed through.
    client.send(b"GET /greet HTTP/1.1\r\nHost: t\r\n\r\n");
    let second = client.read_response();
    assert_eq!(second.body_str(), "tag=none");
    assert_eq!(second.header("x-seen"), Some("none"));
}

fn pipelined_requests_are_served_in_order(server: &common::RunningServer) {
    let mut client = server.connect();

    // Both requests in a single write; responses must come back in
    // arrival order.
    client.send(
        b"POST /echo HTTP/1.1\r\nHost: t\r\nContent-Length: 5\r\n\r\nfirstPOST /echo HTTP/1.1\r\nHost: t\r\nContent-Length: 6\r\n\r\nsecond",
    );

    let one = client.read_response();
    assert_eq!(one.body_str(), "first");
    let two = client.read_response();
    assert_eq!(two.body_str(), "second");
}

fn connection_close_is_honored(server: &common::RunningServer) {
    let mut client = server.connect();
    client.send(b"GET /greet HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n");
    let res = client.read_response();
    assert_eq!(res.status, 200);
    assert_eq!(res.header("connection"), Some("close"));

    // The server closes; further reads hit EOF.
    client.expect_eof();
}

fn malformed_request_is_400_close(server: &common::RunningServer) {
    let mut client = server.connect();
    client.send(b"NOT AN HTTP REQUEST\r\n\r\n");
    let res = client.read_response();
    assert_eq!(res.status, 400);
    assert_eq!(res.header("connection"), Some("close"));
    client.expect_eof();
}

fn takeover_detaches_http(server: &common::RunningServer) {
    let mut client = server.connect();
    client.send(b"GET /upgrade HTTP/1.1\r\nHost: t\r\n\r\n");

    // The takeover owner speaks first, no HTTP response head.
    assert_eq!(client.read_exact_raw(6), b"HELLO\n");

    // Raw bytes now round-trip through the owner's callback.
    client.send(b"ping");
    assert_eq!(client.read_exact_raw(9), b"echo:ping");
}
