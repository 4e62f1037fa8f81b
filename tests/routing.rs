// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Routing behavior over the wire: parameters, wildcards, slash
//! normalization, method dispatch, HEAD and redirects.

use ecewo::status;

mod common;

#[test]
fn routing() {
    let server = common::start_server(|server| {
        server.get("/", |req, res| {
            let path = req.path().to_owned();
            res.send_text(status::OK, path);
        });

        server.get("/users/:id", |req, res| {
            let id = req.param("id").unwrap_or("none").to_owned();
            res.send_text(status::OK, format!("user={id}"));
        });

        server.get("/users/:id/posts/:post", |req, res| {
            let id = req.param("id").unwrap_or("?").to_owned();
            let post = req.param("post").unwrap_or("?").to_owned();
            res.send_text(status::OK, format!("{id}/{post}"));
        });

        server.get("/files/*", |req, res| {
            let path = req.path().to_owned();
            res.send_text(status::OK, format!("file:{path}"));
        });

        server.get("/search", |req, res| {
            let q = req.query("q").unwrap_or("-").to_owned();
            let lang = req.query("lang").unwrap_or("-").to_owned();
            res.send_text(status::OK, format!("q={q} lang={lang}"));
        });

        server.head("/asset", |_req, res| {
            res.send_text(status::OK, "0123456789");
        });

        server.get("/old", |_req, res| {
            res.redirect(status::SEE_OTHER, "/new");
        });

        server.post("/method", |req, res| {
            let method = req.method().to_owned();
            res.send_text(status::OK, method);
        });
        server.put("/method", |req, res| {
            let method = req.method().to_owned();
            res.send_text(status::OK, method);
        });
        server.patch("/method", |req, res| {
            let method = req.method().to_owned();
            res.send_text(status::OK, method);
        });
        server.delete("/method", |req, res| {
            let method = req.method().to_owned();
            res.send_text(status::OK, method);
        });
    });

    root_route(&server);
    param_capture(&server);
    nested_params(&server);
    wildcard_remainder(&server);
    double_slashes_normalize(&server);
    trailing_slash_normalizes(&server);
    query_parameters(&server);
    unknown_route_is_404_keep_alive(&server);
    method_dispatch(&server);
    head_suppresses_body(&server);
    redirect_sets_location(&server);
}

fn root_route(server: &common::RunningServer) {
    let res = server.roundtrip(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "/");
}

fn param_capture(server: &common::RunningServer) {
    let res = server.roundtrip(b"GET /users/123 HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "user=123");
}

fn nested_params(server: &common::RunningServer) {
    let res = server.roundtrip(b"GET /users/7/posts/40 HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "7/40");
}

fn wildcard_remainder(server: &common::RunningServer) {
    let res = server.roundtrip(b"GET /files/a/b/c HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "file:/files/a/b/c");
}

fn double_slashes_normalize(server: &common::RunningServer) {
    let res = server.roundtrip(b"GET //users//123 HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "user=123");
}

fn trailing_slash_normalizes(server: &common::RunningServer) {
    let res = server.roundtrip(b"GET /users/123/ HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "user=123");
}

fn query_parameters(server: &common::RunningServer) {
    let res = server.roundtrip(b"GET /search?q=trie&lang=en HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "q=trie lang=en");
}

fn unknown_route_is_404_keep_alive(server: &common::RunningServer) {
    let res = server.roundtrip(b"GET /missing HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 404);
    assert_eq!(res.body_str(), "404 Not Found");
    assert_eq!(res.header("connection"), Some("keep-alive"));
}

fn method_dispatch(server: &common::RunningServer) {
    for method in ["POST", "PUT", "PATCH", "DELETE"] {
        let raw = format!("{method} /method HTTP/1.1\r\nHost: t\r\n\r\n");
        let res = server.roundtrip(raw.as_bytes());
        assert_eq!(res.status, 200, "{method} failed");
        assert_eq!(res.body_str(), method);
    }

    // GET is not registered on /method.
    let res = server.roundtrip(b"GET /method HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 404);
}

fn head_suppresses_body(server: &common::RunningServer) {
    let mut client = server.connect();
    client.send(b"HEAD /asset HTTP/1.1\r\nHost: t\r\n\r\n");
    let res = client.read_head_response();

    assert_eq!(res.status, 200);
    // Content-Length reflects the would-be body; the wire carries none.
    assert_eq!(res.content_length(), 10);
    assert!(res.body.is_empty());

    // Nothing else follows: the body really was suppressed.
    client.send(b"GET / HTTP/1.1\r\nHost: t\r\n\r\n");
    let next = client.read_response();
    assert_eq!(next.status, 200);
    assert_eq!(next.body_str(), "/");
}

fn redirect_sets_location(server: &common::RunningServer) {
    let res = server.roundtrip(b"GET /old HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 303);
    assert_eq!(res.header("location"), Some("/new"));
    assert_eq!(res.body_str(), "See Other");
}
