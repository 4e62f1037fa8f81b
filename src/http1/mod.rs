// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Incremental HTTP/1.1 request parsing.
//!
//! [`HttpContext`] wraps `httparse` into a push parser with one extra
//! primitive the dispatcher relies on: when the head is complete the
//! context *pauses* instead of running into the body, reporting how many
//! input bytes it consumed. That gives the dispatcher a window to route
//! the request and install a streaming sink before a single body byte
//! flows; resuming means feeding the unconsumed suffix back in.
//!
//! Parsing is strict: no bare-LF header endings beyond what `httparse`
//! tolerates, no `Content-Length` together with `Transfer-Encoding`, no
//! EOF-delimited request bodies.

use arrayvec::ArrayString;
use atoi::atoi;

use crate::arena::{Arena, Span};

pub use self::body_framer::BodyFramer;

mod body_framer;

/// Upper bound on the request head (request line + all headers).
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Upper bound on the request-target length.
pub const MAX_URL_SIZE: usize = 8 * 1024;

/// Upper bound on a single header value.
pub const MAX_HEADER_VALUE_SIZE: usize = 8 * 1024;

/// Upper bound on the method token.
pub const MAX_METHOD_SIZE: usize = 16;

/// Upper bound on the number of request headers.
pub const MAX_HEADERS: usize = 64;

/// Result of one [`HttpContext::feed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The message is complete. `consumed` bytes of this feed belong to
    /// it; anything after is the next pipelined message.
    Success { consumed: usize },
    /// All input consumed, more bytes needed.
    Incomplete,
    /// The head is complete and the parser yielded. `consumed` bytes of
    /// this feed were used; the suffix must be re-fed after the dispatcher
    /// has routed the request.
    Paused { consumed: usize },
    /// Malformed request. Maps to 400.
    Error,
    /// A per-message size limit was exceeded. Maps to 413.
    Overflow,
}

enum Phase {
    Head,
    Body,
    Complete,
}

/// Persistent per-connection parse state, reset between requests.
pub struct HttpContext {
    phase: Phase,
    head: Vec<u8>,
    // Offset up to which `head` was already scanned for the blank line.
    scanned: usize,

    pub method: ArrayString<MAX_METHOD_SIZE>,
    pub path: Span,
    pub query: Vec<(Span, Span)>,
    pub headers: Vec<(Span, Span)>,
    pub http_major: u8,
    pub http_minor: u8,
    pub keep_alive: bool,
    pub content_length: Option<u64>,
    pub chunked: bool,

    framer: BodyFramer,
    /// Buffered body bytes; untouched when a streaming sink is active.
    pub body: Vec<u8>,
    buffered_limit: usize,

    pub headers_complete: bool,
    pub message_complete: bool,
    pub error_reason: Option<&'static str>,
}

impl HttpContext {
    pub fn new(buffered_limit: usize) -> HttpContext {
        HttpContext {
            phase: Phase::Head,
            head: Vec::new(),
            scanned: 0,
            method: ArrayString::new(),
            path: Span::EMPTY,
            query: Vec::new(),
            headers: Vec::new(),
            http_major: 1,
            http_minor: 1,
            keep_alive: true,
            content_length: None,
            chunked: false,
            framer: BodyFramer::None,
            body: Vec::new(),
            buffered_limit,
            headers_complete: false,
            message_complete: false,
            error_reason: None,
        }
    }

    /// Rewinds the context for the next request on the same connection.
    pub fn reset(&mut self) {
        self.phase = Phase::Head;
        self.head.clear();
        self.scanned = 0;
        self.method.clear();
        self.path = Span::EMPTY;
        self.query.clear();
        self.headers.clear();
        self.http_major = 1;
        self.http_minor = 1;
        self.keep_alive = true;
        self.content_length = None;
        self.chunked = false;
        self.framer = BodyFramer::None;
        self.body.clear();
        self.headers_complete = false;
        self.message_complete = false;
        self.error_reason = None;
    }

    /// True if the head announced a body.
    pub fn has_body(&self) -> bool {
        self.chunked || self.content_length.map_or(false, |n| n > 0)
    }

    /// Feeds wire bytes through the parser.
    ///
    /// In the head phase `arena` receives the materialized path, query and
    /// header strings. In the body phase each payload slice goes to `sink`
    /// when one is installed (streaming mode; a `false` return aborts with
    /// [`ParseOutcome::Overflow`]) and is buffered otherwise.
    pub fn feed(
        &mut self,
        arena: &mut Arena,
        input: &[u8],
        sink: Option<&mut dyn FnMut(&[u8]) -> bool>,
    ) -> ParseOutcome {
        match self.phase {
            Phase::Head => self.feed_head(arena, input),
            Phase::Body => self.feed_body(input, sink),
            Phase::Complete => ParseOutcome::Success { consumed: 0 },
        }
    }

    fn feed_head(&mut self, arena: &mut Arena, input: &[u8]) -> ParseOutcome {
        let prior = self.head.len();
        self.head.extend_from_slice(input);

        // Resume the blank-line scan where the previous feed left off,
        // backing up in case the CRLFCRLF straddles the boundary.
        let from = self.scanned.saturating_sub(3);
        let head_end = match find_blank_line(&self.head[from..]) {
            Some(rel) => from + rel,
            None => {
                self.scanned = self.head.len();
                if self.head.len() > MAX_HEAD_SIZE {
                    self.error_reason = Some("request head too large");
                    return ParseOutcome::Overflow;
                }
                return ParseOutcome::Incomplete;
            }
        };

        if head_end > MAX_HEAD_SIZE {
            self.error_reason = Some("request head too large");
            return ParseOutcome::Overflow;
        }

        let outcome = self.parse_head(arena, head_end);
        if !matches!(outcome, ParseOutcome::Paused { .. }) {
            return outcome;
        }

        self.headers_complete = true;
        self.framer = BodyFramer::new(self.content_length, self.chunked);
        if self.framer.is_none() {
            self.message_complete = true;
            self.phase = Phase::Complete;
        } else {
            self.phase = Phase::Body;
        }

        // Bytes of *this* feed that the head swallowed. The remainder is
        // still owned by the caller and comes back after resume.
        self.head.truncate(head_end);
        ParseOutcome::Paused {
            consumed: head_end - prior,
        }
    }

    fn parse_head(&mut self, arena: &mut Arena, head_end: usize) -> ParseOutcome {
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut header_storage);

        match parsed.parse(&self.head[..head_end]) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                self.error_reason = Some("truncated request head");
                return ParseOutcome::Error;
            }
            Err(httparse::Error::TooManyHeaders) => {
                self.error_reason = Some("too many headers");
                return ParseOutcome::Overflow;
            }
            Err(_) => {
                self.error_reason = Some("malformed request head");
                return ParseOutcome::Error;
            }
        }

        let method = parsed.method.unwrap_or_default();
        if method.len() > MAX_METHOD_SIZE {
            self.error_reason = Some("method too long");
            return ParseOutcome::Overflow;
        }
        // Length checked above.
        let _ = self.method.try_push_str(method);

        let url = parsed.path.unwrap_or("/");
        if url.len() > MAX_URL_SIZE {
            self.error_reason = Some("request target too long");
            return ParseOutcome::Overflow;
        }

        let (path, query) = match url.find('?') {
            Some(at) => (&url[..at], &url[at + 1..]),
            None => (url, ""),
        };
        self.path = arena.push_str(if path.is_empty() { "/" } else { path });
        parse_query(arena, query, &mut self.query);

        self.http_major = 1;
        self.http_minor = parsed.version.unwrap_or(1);

        let mut connection_close = false;
        let mut connection_keep_alive = false;

        for header in parsed.headers.iter() {
            if header.value.len() > MAX_HEADER_VALUE_SIZE {
                self.error_reason = Some("header value too long");
                return ParseOutcome::Overflow;
            }
            let Ok(value) = std::str::from_utf8(header.value) else {
                self.error_reason = Some("header value is not valid text");
                return ParseOutcome::Error;
            };

            if header.name.eq_ignore_ascii_case("content-length") {
                if self.content_length.is_some() {
                    self.error_reason = Some("duplicate content-length");
                    return ParseOutcome::Error;
                }
                match atoi::<u64>(value.trim().as_bytes()) {
                    Some(n) => self.content_length = Some(n),
                    None => {
                        self.error_reason = Some("invalid content-length");
                        return ParseOutcome::Error;
                    }
                }
            } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
                if !value.eq_ignore_ascii_case("chunked") {
                    self.error_reason = Some("unsupported transfer-encoding");
                    return ParseOutcome::Error;
                }
                self.chunked = true;
            } else if header.name.eq_ignore_ascii_case("connection") {
                for token in value.split(',') {
                    let token = token.trim();
                    if token.eq_ignore_ascii_case("close") {
                        connection_close = true;
                    } else if token.eq_ignore_ascii_case("keep-alive") {
                        connection_keep_alive = true;
                    }
                }
            }

            let name = arena.push_str(header.name);
            let value = arena.push_str(value);
            self.headers.push((name, value));
        }

        if self.chunked && self.content_length.is_some() {
            self.error_reason = Some("content-length with transfer-encoding");
            return ParseOutcome::Error;
        }

        self.keep_alive = if self.http_minor >= 1 {
            !connection_close
        } else {
            connection_keep_alive
        };

        ParseOutcome::Paused { consumed: 0 }
    }

    /// Body-phase feeding without an arena; the dispatcher calls this
    /// directly when resuming a parked request.
    pub(crate) fn feed_body(
        &mut self,
        input: &[u8],
        mut sink: Option<&mut dyn FnMut(&[u8]) -> bool>,
    ) -> ParseOutcome {
        let mut sink_aborted = false;
        let mut buffer_overflow = false;

        let body = &mut self.body;
        let limit = self.buffered_limit;

        let framed = self.framer.feed(input, &mut |slice| {
            if let Some(sink) = sink.as_mut() {
                if !sink_aborted && !sink(slice) {
                    sink_aborted = true;
                }
            } else if !buffer_overflow {
                if body.len() + slice.len() > limit {
                    buffer_overflow = true;
                } else {
                    body.extend_from_slice(slice);
                }
            }
        });

        let framed = match framed {
            Ok(framed) => framed,
            Err(err) => {
                self.error_reason = Some(err.0);
                return ParseOutcome::Error;
            }
        };

        if sink_aborted {
            self.error_reason = Some("streaming body limit exceeded");
            return ParseOutcome::Overflow;
        }
        if buffer_overflow {
            self.error_reason = Some("buffered body too large");
            return ParseOutcome::Overflow;
        }

        if framed.finished {
            self.message_complete = true;
            self.phase = Phase::Complete;
            ParseOutcome::Success {
                consumed: framed.consumed,
            }
        } else {
            ParseOutcome::Incomplete
        }
    }
}

fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn parse_query(arena: &mut Arena, query: &str, out: &mut Vec<(Span, Span)>) {
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.find('=') {
            Some(at) => (&pair[..at], &pair[at + 1..]),
            None => (pair, ""),
        };
        let key = arena.push_str(key);
        let value = arena.push_str(value);
        out.push((key, value));
    }
}
