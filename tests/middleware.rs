// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Middleware chains over the wire: ordering, short-circuiting,
//! per-request context, OPTIONS preflight and asynchronous middleware.

use ecewo::{middleware, spawn_http, status, Method};

mod common;

struct AuthInfo {
    user: String,
    role: String,
}

#[test]
fn middleware_chains() {
    let server = common::start_server(|server| {
        server.use_middleware(middleware(|req, res, next| {
            req.set_context("trace", String::from("g1"));
            next.run(req, res);
        }));

        server.route(
            Method::Get,
            "/ordered",
            vec![
                middleware(|req, res, next| {
                    let trace = req.context::<String>("trace").unwrap();
                    req.set_context("trace", format!("{trace},r1"));
                    next.run(req, res);
                }),
                middleware(|req, res, next| {
                    let trace = req.context::<String>("trace").unwrap();
                    req.set_context("trace", format!("{trace},r2"));
                    next.run(req, res);
                }),
            ],
            |req, res| {
                let trace = req.context::<String>("trace").unwrap();
                res.send_text(status::OK, format!("{trace},handler"));
            },
        );

        server.route(
            Method::Get,
            "/guarded",
            vec![middleware(|req, res, next| {
                if req.header("Authorization").is_none() {
                    res.send_text(status::UNAUTHORIZED, "no");
                    return;
                }
                next.run(req, res);
            })],
            |_req, res| {
                res.send_text(status::OK, "secret");
            },
        );

        server.route(
            Method::Get,
            "/async-auth",
            vec![middleware(|req, res, next| {
                if req.header("Authorization").is_none() {
                    res.send_text(status::UNAUTHORIZED, "Unauthorized");
                    return;
                }
                spawn_http(
                    res,
                    || {
                        std::thread::sleep(std::time::Duration::from_millis(50));
                        ("user123".to_owned(), "admin".to_owned())
                    },
                    move |req, res, (user, role)| {
                        req.set_context("user", AuthInfo { user, role });
                        next.run(req, res);
                    },
                );
            })],
            |req, res| {
                match req.context::<AuthInfo>("user") {
                    Some(info) => {
                        let text = format!("Welcome {} (role: {})", info.user, info.role);
                        res.send_text(status::OK, text);
                    }
                    None => res.send_text(status::INTERNAL_SERVER_ERROR, "no auth context"),
                }
            },
        );

        // CORS-style preflight answering from global middleware.
        server.use_middleware(middleware(|req, res, next| {
            if req.method() == "OPTIONS" {
                res.set_header("Access-Control-Allow-Origin", "*");
                res.reply(status::NO_CONTENT, "");
                return;
            }
            next.run(req, res);
        }));
    });

    declared_order(&server);
    short_circuit_skips_handler(&server);
    async_middleware_with_token(&server);
    async_middleware_without_token(&server);
    options_preflight_hits_global_chain(&server);
}

fn declared_order(server: &common::RunningServer) {
    let res = server.roundtrip(b"GET /ordered HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "g1,r1,r2,handler");
}

fn short_circuit_skips_handler(server: &common::RunningServer) {
    let res = server.roundtrip(b"GET /guarded HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 401);
    assert_eq!(res.body_str(), "no");

    let res = server.roundtrip(b"GET /guarded HTTP/1.1\r\nHost: t\r\nAuthorization: yes\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "secret");
}

fn async_middleware_with_token(server: &common::RunningServer) {
    let res = server.roundtrip(
        b"GET /async-auth HTTP/1.1\r\nHost: t\r\nAuthorization: Bearer token123\r\n\r\n",
    );
    assert_eq!(res.status, 200);
    assert_eq!(res.body_str(), "Welcome user123 (role: admin)");
}

fn async_middleware_without_token(server: &common::RunningServer) {
    let res = server.roundtrip(b"GET /async-auth HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 401);
    assert_eq!(res.body_str(), "Unauthorized");
}

fn options_preflight_hits_global_chain(server: &common::RunningServer) {
    let res = server.roundtrip(b"OPTIONS /anything HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(res.status, 204);
    assert_eq!(res.header("access-control-allow-origin"), Some("*"));
}
