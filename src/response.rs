// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The response object and the single write path.
//!
//! [`Res::reply`] is the one exit for every request: it formats the
//! status line, the cached `Date`, every user header in insertion order,
//! `Content-Length`, `Connection` and the body into one heap buffer and
//! queues it on the connection. Responses are single-shot with a known
//! length; there is no chunked response encoding.
//!
//! The buffer is heap-allocated rather than arena-backed on purpose: the
//! reactor may still be flushing it after the request's arena has been
//! rewound for the next request on the connection.

use crate::connection::ClientHandle;
use crate::date::DateCache;

/// Common status codes, for readable call sites.
pub mod status {
    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const NO_CONTENT: u16 = 204;
    pub const MOVED_PERMANENTLY: u16 = 301;
    pub const FOUND: u16 = 302;
    pub const SEE_OTHER: u16 = 303;
    pub const TEMPORARY_REDIRECT: u16 = 307;
    pub const PERMANENT_REDIRECT: u16 = 308;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const PAYLOAD_TOO_LARGE: u16 = 413;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
}

/// Returns the phrase corresponding to a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Time-out",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Time-out",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

pub(crate) enum Writer {
    /// Queue the formatted bytes on a live connection.
    Client(ClientHandle),
    /// Capture the formatted bytes; unit tests assert on the wire form.
    #[cfg(test)]
    Capture {
        date: std::rc::Rc<DateCache>,
        out: std::rc::Rc<std::cell::RefCell<Vec<u8>>>,
    },
}

/// An outgoing HTTP response.
pub struct Res {
    status: u16,
    headers: Vec<(String, String)>,
    keep_alive: bool,
    replied: bool,
    is_head: bool,
    writer: Writer,
}

impl Res {
    pub(crate) fn new(client: ClientHandle, keep_alive: bool, is_head: bool) -> Res {
        Res {
            status: status::OK,
            headers: Vec::new(),
            keep_alive,
            replied: false,
            is_head,
            writer: Writer::Client(client),
        }
    }

    #[cfg(test)]
    pub(crate) fn capture(
        date: std::rc::Rc<DateCache>,
        out: std::rc::Rc<std::cell::RefCell<Vec<u8>>>,
    ) -> Res {
        Res {
            status: status::OK,
            headers: Vec::new(),
            keep_alive: true,
            replied: false,
            is_head: false,
            writer: Writer::Capture { date, out },
        }
    }

    /// The status set by the last `reply`; 200 until then.
    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// True once a reply has been sent. Further sends are no-ops.
    #[inline]
    pub fn replied(&self) -> bool {
        self.replied
    }

    /// Whether the connection stays open after this response. Seeded from
    /// the request's keep-alive judgment.
    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Forces `Connection: close` on this response.
    pub fn set_close(&mut self) {
        self.keep_alive = false;
    }

    #[cfg(test)]
    pub(crate) fn set_head_request(&mut self, is_head: bool) {
        self.is_head = is_head;
    }

    /// Marks the response as sent without emitting anything, for
    /// connection takeover where the new owner speaks first.
    pub(crate) fn mark_replied(&mut self) {
        self.replied = true;
    }

    pub(crate) fn client(&self) -> Option<&ClientHandle> {
        match &self.writer {
            Writer::Client(client) => Some(client),
            #[cfg(test)]
            Writer::Capture { .. } => None,
        }
    }

    /// Appends a response header.
    ///
    /// Names must be alphanumeric plus `-`/`_`; values must be visible
    /// ASCII or horizontal tab, with CR/LF rejected outright. Invalid
    /// input is refused and logged, leaving the response unchanged.
    /// Duplicates are not suppressed: every accepted call puts one more
    /// line on the wire, in call order.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if self.replied {
            log::debug!("set_header({name:?}) after reply is a no-op");
            return;
        }
        if !is_valid_header_name(name) {
            log::error!("invalid header name: {name:?}");
            return;
        }
        if !is_valid_header_value(value) {
            log::error!("invalid header value for {name:?}");
            return;
        }

        if log::log_enabled!(log::Level::Debug) {
            if self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name)) {
                log::debug!("duplicate header {name:?}: all values will be sent");
            }
        }

        self.headers.push((name.to_owned(), value.to_owned()));
    }

    /// Sends the response.
    ///
    /// This is the single exit of the request lifecycle. The first call
    /// wins; later calls (and later `set_header`s) are no-ops. For HEAD
    /// requests the body is left off the wire while `Content-Length`
    /// still reflects its length.
    pub fn reply(&mut self, status: u16, body: impl AsRef<[u8]>) {
        if self.replied {
            return;
        }
        self.replied = true;
        self.status = status;

        let body = body.as_ref();
        match &self.writer {
            Writer::Client(client) => {
                if !client.valid_for_write() {
                    log::debug!("reply({status}) dropped: connection no longer writable");
                    return;
                }
                let client = client.clone();
                let mut out = Vec::with_capacity(256 + body.len());
                self.format(&mut out, status, &client.shared().date, body);
                client.queue_write(out);
            }
            #[cfg(test)]
            Writer::Capture { date, out } => {
                let date = date.clone();
                let out = out.clone();
                let mut buffer = Vec::with_capacity(256 + body.len());
                self.format(&mut buffer, status, &date, body);
                out.borrow_mut().extend_from_slice(&buffer);
            }
        }
    }

    fn format(&self, out: &mut Vec<u8>, status: u16, date: &DateCache, body: &[u8]) {
        let mut itoa = itoa::Buffer::new();

        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(itoa.format(status).as_bytes());
        out.extend_from_slice(b"\r\nDate: ");
        date.write_to(out);
        out.extend_from_slice(b"\r\n");

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        // Content-Length always reflects the full body, even when HEAD
        // suppresses the payload below.
        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(itoa.format(body.len()).as_bytes());
        out.extend_from_slice(b"\r\nConnection: ");
        out.extend_from_slice(if self.keep_alive {
            b"keep-alive".as_slice()
        } else {
            b"close".as_slice()
        });
        out.extend_from_slice(b"\r\n\r\n");

        if !self.is_head {
            out.extend_from_slice(body);
        }
    }

    /// Sends a `text/plain` response.
    pub fn send_text(&mut self, status: u16, text: impl AsRef<str>) {
        self.set_header("Content-Type", "text/plain");
        self.reply(status, text.as_ref().as_bytes());
    }

    /// Sends an `application/json` response. The payload is taken as-is;
    /// serialization is the caller's business.
    pub fn send_json(&mut self, status: u16, json: impl AsRef<str>) {
        self.set_header("Content-Type", "application/json");
        self.reply(status, json.as_ref().as_bytes());
    }

    /// Sends a redirect to `url` with a short reason-phrase body.
    ///
    /// URLs containing CR or LF are refused with a 400.
    pub fn redirect(&mut self, status: u16, url: &str) {
        if self.replied {
            return;
        }
        if !is_valid_header_value(url) {
            log::error!("redirect URL contains CR/LF");
            self.send_text(status::BAD_REQUEST, "Bad Request");
            return;
        }

        self.set_header("Location", url);
        self.set_header("Content-Type", "text/plain");

        let message = match status {
            status::MOVED_PERMANENTLY
            | status::FOUND
            | status::SEE_OTHER
            | status::TEMPORARY_REDIRECT
            | status::PERMANENT_REDIRECT => reason_phrase(status),
            _ => "Redirect",
        };
        self.reply(status, message.as_bytes());
    }
}

fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn is_valid_header_value(value: &str) -> bool {
    value.bytes().all(|b| b == b'\t' || (32..=126).contains(&b))
}

/// Formats a canned error response (400/413/500 class): reason phrase on
/// the status line and in the body, `Connection: close`.
pub(crate) fn error_response(status: u16, date: &DateCache) -> Vec<u8> {
    let phrase = reason_phrase(status);
    let mut itoa = itoa::Buffer::new();
    let mut out = Vec::with_capacity(160);

    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(itoa.format(status).as_bytes());
    out.push(b' ');
    out.extend_from_slice(phrase.as_bytes());
    out.extend_from_slice(b"\r\nDate: ");
    date.write_to(&mut out);
    out.extend_from_slice(b"\r\nContent-Type: text/plain\r\nContent-Length: ");
    out.extend_from_slice(itoa.format(phrase.len()).as_bytes());
    out.extend_from_slice(b"\r\nConnection: close\r\n\r\n");
    out.extend_from_slice(phrase.as_bytes());
    out
}
