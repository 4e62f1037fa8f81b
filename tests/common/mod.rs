// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Raw-TCP test harness: boots a server on its own thread and speaks
//! HTTP/1.1 to it byte by byte.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use ecewo::{Server, ShutdownHandle};

pub struct RunningServer {
    pub port: u16,
    shutdown: ShutdownHandle,
    thread: Option<thread::JoinHandle<()>>,
}

/// Builds a server on a fresh reactor thread, runs `setup` to register
/// routes, and returns once the listening socket accepts connections.
pub fn start_server<F>(setup: F) -> RunningServer
where
    F: FnOnce(&Server) + Send + 'static,
{
    std::env::set_var("ECEWO_TEST_MODE", "1");

    let port = free_port();
    let (tx, rx) = mpsc::channel();

    let thread = thread::spawn(move || {
        let server = Server::new().expect("server init");
        setup(&server);
        server.listen(port).expect("listen");
        tx.send(server.shutdown_handle()).expect("handshake");
        server.run();
    });

    let shutdown = rx.recv().expect("server thread died during startup");

    // The listener exists once listen() returned; connecting may still
    // race the reactor's first poll, so retry briefly.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(_) => break,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Err(e) => panic!("server never became reachable: {e}"),
        }
    }

    RunningServer {
        port,
        shutdown,
        thread: Some(thread),
    }
}

impl RunningServer {
    pub fn connect(&self) -> Client {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        Client {
            stream,
            buf: Vec::new(),
        }
    }

    /// One-shot exchange on a fresh connection.
    pub fn roundtrip(&self, raw: &[u8]) -> Response {
        let mut client = self.connect();
        client.send(raw);
        client.read_response()
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("probe port");
    listener.local_addr().expect("probe addr").port()
}

/// A client connection that frames responses by `Content-Length`,
/// keeping read-ahead bytes so keep-alive and pipelined responses
/// survive arriving in one TCP segment.
pub struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    pub fn send(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).expect("send request");
        self.stream.flush().expect("flush request");
    }

    /// Reads one framed response.
    pub fn read_response(&mut self) -> Response {
        self.read_response_inner(false)
    }

    /// Reads a response to a HEAD request: headers only, no body even
    /// when a `Content-Length` is declared.
    pub fn read_head_response(&mut self) -> Response {
        self.read_response_inner(true)
    }

    fn read_response_inner(&mut self, head_request: bool) -> Response {
        let mut chunk = [0u8; 2048];

        let head_end = loop {
            if let Some(at) = find_subslice(&self.buf, b"\r\n\r\n") {
                break at + 4;
            }
            let n = self.stream.read(&mut chunk).expect("read response head");
            assert!(n > 0, "connection closed before response head completed");
            self.buf.extend_from_slice(&chunk[..n]);
        };

        let head =
            std::str::from_utf8(&self.buf[..head_end]).expect("response head is not UTF-8");
        let mut lines = head.split("\r\n");

        let status_line = lines.next().expect("missing status line");
        assert!(
            status_line.starts_with("HTTP/1.1 "),
            "bad status line: {status_line}"
        );
        let status: u16 = status_line["HTTP/1.1 ".len()..]
            .split(' ')
            .next()
            .expect("status code")
            .parse()
            .expect("numeric status");

        let headers: Vec<(String, String)> = lines
            .take_while(|line| !line.is_empty())
            .map(|line| {
                let (name, value) = line.split_once(": ").expect("malformed header line");
                (name.to_owned(), value.to_owned())
            })
            .collect();

        let content_length: usize = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(0);

        self.buf.drain(..head_end);

        let body = if head_request {
            Vec::new()
        } else {
            while self.buf.len() < content_length {
                let n = self.stream.read(&mut chunk).expect("read response body");
                assert!(n > 0, "connection closed mid-body");
                self.buf.extend_from_slice(&chunk[..n]);
            }
            self.buf.drain(..content_length).collect()
        };

        Response {
            status,
            headers,
            body,
        }
    }

    /// Asserts the server closes the connection without further data.
    pub fn expect_eof(&mut self) {
        assert!(
            self.buf.is_empty(),
            "unexpected trailing bytes: {:?}",
            self.buf
        );
        let mut rest = Vec::new();
        self.stream.read_to_end(&mut rest).expect("read to eof");
        assert!(rest.is_empty(), "unexpected bytes before EOF: {rest:?}");
    }

    /// Reads exactly `n` raw bytes (for takeover-mode conversations).
    pub fn read_exact_raw(&mut self, n: usize) -> Vec<u8> {
        let mut chunk = [0u8; 2048];
        while self.buf.len() < n {
            let read = self.stream.read(&mut chunk).expect("read raw bytes");
            assert!(read > 0, "connection closed mid-frame");
            self.buf.extend_from_slice(&chunk[..read]);
        }
        self.buf.drain(..n).collect()
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).expect("response body is not UTF-8")
    }

    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.parse().ok())
            .expect("missing Content-Length")
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
