// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Per-request bump allocation.
//!
//! An [`Arena`] is a single growable byte region. Allocations bump a fill
//! mark and hand out [`Span`] handles (offset + length) instead of
//! references, so they stay valid when the region grows. [`Arena::reset`]
//! rewinds the fill mark without releasing capacity, which is what makes
//! per-request reuse cheap.
//!
//! An [`ArenaPool`] keeps a bounded free list of empty arenas so that each
//! connection can borrow one for its lifetime and hand it back on close.
//! The pool lives on the reactor thread and must only be touched from
//! there.

use std::fmt;
use std::fmt::Write as _;

/// Default capacity of a fresh arena region.
const DEFAULT_REGION_SIZE: usize = 8 * 1024;

/// Number of empty arenas the pool keeps around.
const POOL_MAX_IDLE: usize = 64;

/// A handle to a byte range inside an [`Arena`].
///
/// Spans are plain indices: copying one is free and it survives arena
/// growth. Resolving a span requires the arena it came from; resolving it
/// against another arena, or after `reset`, yields unrelated bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    start: u32,
    len: u32,
}

impl Span {
    /// The empty span, valid in any arena.
    pub const EMPTY: Span = Span { start: 0, len: 0 };

    /// Length of the spanned range in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True if the span covers no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A bump region for request-scoped allocation.
pub struct Arena {
    buf: Vec<u8>,
}

impl Arena {
    /// Creates an arena with the default region size.
    pub fn new() -> Arena {
        Arena::with_capacity(DEFAULT_REGION_SIZE)
    }

    /// Creates an arena with at least `capacity` bytes pre-allocated.
    pub fn with_capacity(capacity: usize) -> Arena {
        Arena {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Copies `bytes` into the arena and returns its span.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Span {
        let start = self.buf.len();
        self.buf.extend_from_slice(bytes);
        span(start, bytes.len())
    }

    /// Copies `s` into the arena and returns its span.
    ///
    /// Spans produced here always resolve back through [`Arena::str`].
    #[inline]
    pub fn push_str(&mut self, s: &str) -> Span {
        self.push_bytes(s.as_bytes())
    }

    /// Formats `args` into the arena and returns the span of the output.
    pub fn push_fmt(&mut self, args: fmt::Arguments<'_>) -> Span {
        let start = self.buf.len();
        let mut writer = FmtAdapter { buf: &mut self.buf };
        // Writing to a Vec cannot fail.
        let _ = writer.write_fmt(args);
        span(start, self.buf.len() - start)
    }

    /// Extends `old` with `bytes`.
    ///
    /// If `old` is the most recent allocation the bytes are appended in
    /// place; otherwise the old range is copied to the top first. Either
    /// way the returned span covers old + new bytes.
    pub fn append(&mut self, old: Span, bytes: &[u8]) -> Span {
        let is_last = old.start as usize + old.len as usize == self.buf.len();
        if is_last {
            self.buf.extend_from_slice(bytes);
            span(old.start as usize, old.len as usize + bytes.len())
        } else {
            let start = self.buf.len();
            self.buf.extend_from_within(old.start as usize..(old.start + old.len) as usize);
            self.buf.extend_from_slice(bytes);
            span(start, old.len as usize + bytes.len())
        }
    }

    /// Resolves a span to its bytes.
    #[inline]
    pub fn bytes(&self, span: Span) -> &[u8] {
        &self.buf[span.start as usize..(span.start + span.len) as usize]
    }

    /// Resolves a span to a string slice.
    ///
    /// Only meaningful for spans produced by [`Arena::push_str`] or
    /// [`Arena::push_fmt`]; other spans resolve to `""` if their bytes are
    /// not UTF-8.
    #[inline]
    pub fn str(&self, span: Span) -> &str {
        let bytes = self.bytes(span);
        debug_assert!(std::str::from_utf8(bytes).is_ok());
        std::str::from_utf8(bytes).unwrap_or_default()
    }

    /// Rewinds the fill mark to zero without releasing capacity.
    ///
    /// Every outstanding span becomes dangling in the logical sense; the
    /// borrow checker prevents any `&str`/`&[u8]` resolved from this arena
    /// from surviving the call.
    #[inline]
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Number of bytes currently allocated.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been allocated since the last reset.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Capacity of the backing region.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}

impl Default for Arena {
    fn default() -> Arena {
        Arena::new()
    }
}

#[inline]
fn span(start: usize, len: usize) -> Span {
    debug_assert!(start <= u32::MAX as usize && len <= u32::MAX as usize);
    Span {
        start: start as u32,
        len: len as u32,
    }
}

struct FmtAdapter<'a> {
    buf: &'a mut Vec<u8>,
}

impl fmt::Write for FmtAdapter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

/// A bounded free list of empty arenas.
///
/// `borrow` pops an arena (or allocates a fresh one), `give_back` resets
/// the arena and keeps it if the free list has room. Reactor thread only.
pub struct ArenaPool {
    free: Vec<Arena>,
    max_idle: usize,
}

impl ArenaPool {
    pub fn new() -> ArenaPool {
        ArenaPool {
            free: Vec::new(),
            max_idle: POOL_MAX_IDLE,
        }
    }

    /// Takes an arena out of the pool, allocating if the pool is empty.
    pub fn borrow(&mut self) -> Arena {
        self.free.pop().unwrap_or_default()
    }

    /// Returns an arena to the pool.
    pub fn give_back(&mut self, mut arena: Arena) {
        if self.free.len() < self.max_idle {
            arena.reset();
            self.free.push(arena);
        }
    }

    /// Number of idle arenas currently pooled.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

impl Default for ArenaPool {
    fn default() -> ArenaPool {
        ArenaPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Arena, ArenaPool, Span};

    #[test]
    fn push_and_resolve() {
        let mut arena = Arena::new();
        let hello = arena.push_str("hello");
        let world = arena.push_bytes(b" world");

        assert_eq!(arena.str(hello), "hello");
        assert_eq!(arena.bytes(world), b" world");
        assert_eq!(arena.len(), 11);
    }

    #[test]
    fn spans_survive_growth() {
        let mut arena = Arena::with_capacity(8);
        let first = arena.push_str("0123");
        // Force the region to grow several times over.
        let mut spans = Vec::new();
        for _ in 0..64 {
            spans.push(arena.push_bytes(&[0xAB; 64]));
        }
        assert_eq!(arena.str(first), "0123");
        for span in spans {
            assert!(arena.bytes(span).iter().all(|&b| b == 0xAB));
        }
    }

    #[test]
    fn append_in_place_when_last() {
        let mut arena = Arena::new();
        let value = arena.push_str("keep-");
        let value = arena.append(value, b"alive");
        assert_eq!(arena.str(value), "keep-alive");
        // No copy happened: total fill equals the final length.
        assert_eq!(arena.len(), 10);
    }

    #[test]
    fn append_copies_when_not_last() {
        let mut arena = Arena::new();
        let value = arena.push_str("chunked");
        arena.push_str("interloper");
        let value = arena.append(value, b", gzip");
        assert_eq!(arena.str(value), "chunked, gzip");
    }

    #[test]
    fn push_fmt_formats() {
        let mut arena = Arena::new();
        let s = arena.push_fmt(format_args!("id={} len={}", 42, 7));
        assert_eq!(arena.str(s), "id=42 len=7");
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut arena = Arena::new();
        arena.push_bytes(&[0u8; 4096]);
        let cap = arena.capacity();
        arena.reset();
        assert!(arena.is_empty());
        assert_eq!(arena.capacity(), cap);
    }

    #[test]
    fn empty_span_resolves_anywhere() {
        let arena = Arena::new();
        assert_eq!(arena.bytes(Span::EMPTY), b"");
        assert_eq!(arena.str(Span::EMPTY), "");
    }

    #[test]
    fn pool_recycles_reset_arenas() {
        let mut pool = ArenaPool::new();
        let mut arena = pool.borrow();
        arena.push_str("leftover request state");
        let cap = arena.capacity();

        pool.give_back(arena);
        assert_eq!(pool.idle(), 1);

        let arena = pool.borrow();
        assert!(arena.is_empty());
        assert_eq!(arena.capacity(), cap);
        assert_eq!(pool.idle(), 0);
    }
}
