// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The request object handed to middleware and handlers.
//!
//! A `Req` owns the arena its strings were materialized into; fields are
//! [`Span`] handles resolved on access. Ownership of the arena travels
//! with the request through pending-dispatch slots and worker-bridge
//! completions, and returns to the connection when the response is
//! written.

use std::any::Any;
use std::rc::Rc;

use arrayvec::ArrayString;

use crate::arena::{Arena, Span};
use crate::http1::{HttpContext, MAX_METHOD_SIZE};

/// An incoming HTTP request.
pub struct Req {
    arena: Arena,
    method: ArrayString<MAX_METHOD_SIZE>,
    path: Span,
    http_major: u8,
    http_minor: u8,
    headers: Vec<(Span, Span)>,
    query: Vec<(Span, Span)>,
    params: Vec<(Span, Span)>,
    body: Option<Span>,
    is_head: bool,
    streaming: bool,
    ctx: Vec<(Box<str>, Rc<dyn Any>)>,
}

impl Req {
    /// Builds a request from a paused parse context, taking over the
    /// arena the context materialized into.
    pub(crate) fn from_context(arena: Arena, ctx: &mut HttpContext) -> Req {
        Req {
            arena,
            method: ctx.method,
            path: ctx.path,
            http_major: ctx.http_major,
            http_minor: ctx.http_minor,
            headers: std::mem::take(&mut ctx.headers),
            query: std::mem::take(&mut ctx.query),
            params: Vec::new(),
            body: None,
            is_head: ctx.method.as_str() == "HEAD",
            streaming: false,
            ctx: Vec::new(),
        }
    }

    /// Copies a captured route parameter into the request.
    pub(crate) fn push_param(&mut self, name: &str, value: &str) {
        let name = self.arena.push_str(name);
        let value = self.arena.push_str(value);
        self.params.push((name, value));
    }

    /// Installs the buffered body once the message is complete.
    pub(crate) fn attach_body(&mut self, bytes: &[u8]) {
        self.body = Some(self.arena.push_bytes(bytes));
    }

    pub(crate) fn set_streaming(&mut self) {
        self.streaming = true;
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Releases the arena back to the connection.
    pub(crate) fn into_arena(self) -> Arena {
        self.arena
    }

    /// The request method token, e.g. `"GET"`.
    #[inline]
    pub fn method(&self) -> &str {
        self.method.as_str()
    }

    /// The request path, without the query string.
    #[inline]
    pub fn path(&self) -> &str {
        self.arena.str(self.path)
    }

    /// HTTP version as `(major, minor)`.
    #[inline]
    pub fn http_version(&self) -> (u8, u8) {
        (self.http_major, self.http_minor)
    }

    /// Looks up a header by case-insensitive name. The first matching
    /// header wins; iteration order is wire order.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| self.arena.str(*k).eq_ignore_ascii_case(name))
            .map(|(_, v)| self.arena.str(*v))
    }

    /// All headers in wire order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(k, v)| (self.arena.str(*k), self.arena.str(*v)))
    }

    /// Looks up a query parameter by exact name.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| self.arena.str(*k) == name)
            .map(|(_, v)| self.arena.str(*v))
    }

    /// All query parameters in declaration order.
    pub fn query_params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.query
            .iter()
            .map(|(k, v)| (self.arena.str(*k), self.arena.str(*v)))
    }

    /// Looks up a route parameter captured by the trie, e.g. `"id"` for
    /// a route registered as `/users/:id`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| self.arena.str(*k) == name)
            .map(|(_, v)| self.arena.str(*v))
    }

    /// All route parameters in capture order.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params
            .iter()
            .map(|(k, v)| (self.arena.str(*k), self.arena.str(*v)))
    }

    /// The buffered request body.
    ///
    /// `None` when the request has no body and always `None` in
    /// streaming mode, where bytes only flow through `body_on_data`.
    pub fn body_bytes(&self) -> Option<&[u8]> {
        if self.streaming {
            return None;
        }
        self.body.map(|span| self.arena.bytes(span))
    }

    /// Length of the buffered body; `0` in streaming mode.
    pub fn body_len(&self) -> usize {
        if self.streaming {
            return 0;
        }
        self.body.map_or(0, |span| span.len())
    }

    /// The buffered body as text, when it is valid UTF-8.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(self.body_bytes()?).ok()
    }

    /// True for `HEAD` requests; the response body will be suppressed on
    /// the wire while keeping its `Content-Length`.
    #[inline]
    pub fn is_head_request(&self) -> bool {
        self.is_head
    }

    /// Stores an arbitrary per-request value under `key`, replacing any
    /// previous value. Middleware uses this to pass state downstream.
    pub fn set_context<T: Any>(&mut self, key: &str, value: T) {
        self.set_context_rc(key, Rc::new(value));
    }

    pub(crate) fn set_context_rc(&mut self, key: &str, value: Rc<dyn Any>) {
        if let Some(slot) = self.ctx.iter_mut().find(|(k, _)| &**k == key) {
            slot.1 = value;
        } else {
            self.ctx.push((key.into(), value));
        }
    }

    /// Retrieves a value stored with [`Req::set_context`], if `key` is
    /// present and holds a `T`.
    pub fn context<T: Any>(&self, key: &str) -> Option<Rc<T>> {
        let value = self.ctx.iter().find(|(k, _)| &**k == key)?.1.clone();
        value.downcast().ok()
    }
}

#[cfg(test)]
mod tests {
    use crate::arena::Arena;
    use crate::http1::{HttpContext, ParseOutcome};
    use crate::request::Req;
    use std::cell::Cell;
    use std::rc::Rc;

    fn parse(wire: &[u8]) -> Req {
        let mut arena = Arena::new();
        let mut ctx = HttpContext::new(10 * 1024 * 1024);
        match ctx.feed(&mut arena, wire, None) {
            ParseOutcome::Paused { .. } => {}
            other => panic!("unexpected outcome {other:?}"),
        }
        Req::from_context(arena, &mut ctx)
    }

    #[test]
    fn accessors_resolve_spans() {
        let req = parse(b"GET /search?q=trie&lang=en HTTP/1.1\r\nHost: h\r\nX-Tag: a\r\nX-Tag: b\r\n\r\n");

        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.http_version(), (1, 1));
        assert_eq!(req.query("q"), Some("trie"));
        assert_eq!(req.query("lang"), Some("en"));
        assert_eq!(req.query("missing"), None);
        // Case-insensitive lookup, first value wins.
        assert_eq!(req.header("HOST"), Some("h"));
        assert_eq!(req.header("x-tag"), Some("a"));
        assert_eq!(req.headers().count(), 3);
    }

    #[test]
    fn params_come_from_the_dispatcher() {
        let mut req = parse(b"GET /users/42 HTTP/1.1\r\n\r\n");
        req.push_param("id", "42");
        assert_eq!(req.param("id"), Some("42"));
        assert_eq!(req.params().collect::<Vec<_>>(), [("id", "42")]);
    }

    #[test]
    fn head_flag_from_method() {
        let req = parse(b"HEAD /x HTTP/1.1\r\n\r\n");
        assert!(req.is_head_request());
    }

    #[test]
    fn body_accessors_in_both_modes() {
        let mut req = parse(b"POST /e HTTP/1.1\r\nContent-Length: 7\r\n\r\n");
        assert_eq!(req.body_bytes(), None);
        req.attach_body(b"{\"x\":1}");
        assert_eq!(req.body_bytes(), Some(&b"{\"x\":1}"[..]));
        assert_eq!(req.body_len(), 7);
        assert_eq!(req.body_str(), Some("{\"x\":1}"));

        let mut req = parse(b"POST /s HTTP/1.1\r\nContent-Length: 7\r\n\r\n");
        req.set_streaming();
        assert_eq!(req.body_bytes(), None);
        assert_eq!(req.body_len(), 0);
    }

    #[test]
    fn context_store_replaces_and_downcasts() {
        let mut req = parse(b"GET / HTTP/1.1\r\n\r\n");

        req.set_context("user", "alice".to_string());
        req.set_context("count", Cell::new(1u32));

        let user: Rc<String> = req.context("user").unwrap();
        assert_eq!(&*user, "alice");
        assert!(req.context::<u32>("user").is_none());

        let count: Rc<Cell<u32>> = req.context("count").unwrap();
        count.set(2);
        assert_eq!(req.context::<Cell<u32>>("count").unwrap().get(), 2);

        req.set_context("user", "bob".to_string());
        assert_eq!(&*req.context::<String>("user").unwrap(), "bob");
    }
}
