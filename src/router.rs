// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Route lookup.
//!
//! Routes live in a radix trie keyed by path bytes. Each node additionally
//! carries a parameter child (`:name` segments, capturing one segment) and
//! a wildcard child (`*`, terminal, matching any remainder). Terminal
//! nodes store one entry per method.
//!
//! Matching tries, per segment: exact bytes, then parameter, then
//! wildcard, backtracking captured parameters on failure. The tokenizer
//! skips empty segments, so `//a//b` and `/a/b/` both resolve like
//! `/a/b`.
//!
//! The trie sits behind a reader/writer lock: lookups take the read lock
//! on the dispatch path, registration takes the write lock. In practice
//! all registrations happen before `run`.

use arrayvec::ArrayVec;

use crate::middleware::RouteEntry;

/// Deepest accepted path, in segments.
pub const MAX_PATH_SEGMENTS: usize = 32;

/// Inline capacity for captured parameters. Running out of slots makes
/// the parameter branch fail, like any other mismatch.
pub const MAX_PARAMS: usize = 32;

/// The request methods routes can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

pub const METHOD_COUNT: usize = 7;

impl Method {
    /// Maps a request method token, case-sensitively per RFC 7230.
    pub fn from_token(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Splits a request path into its non-empty segments.
///
/// Paths deeper than [`MAX_PATH_SEGMENTS`] do not tokenize; the caller
/// treats that as a lookup miss.
pub fn tokenize_path(path: &str) -> Option<ArrayVec<&str, MAX_PATH_SEGMENTS>> {
    let mut segments = ArrayVec::new();
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segments.try_push(segment).is_err() {
            log::debug!("path too deep: more than {MAX_PATH_SEGMENTS} segments");
            return None;
        }
    }
    Some(segments)
}

struct Node {
    children: Vec<(u8, Node)>,
    param_child: Option<Box<Node>>,
    param_name: Option<Box<str>>,
    wildcard_child: Option<Box<Node>>,
    entries: [Option<RouteEntry>; METHOD_COUNT],
    is_end: bool,
}

impl Node {
    fn new() -> Node {
        Node {
            children: Vec::new(),
            param_child: None,
            param_name: None,
            wildcard_child: None,
            entries: Default::default(),
            is_end: false,
        }
    }

    fn child(&self, byte: u8) -> Option<&Node> {
        self.children
            .iter()
            .find(|(b, _)| *b == byte)
            .map(|(_, node)| node)
    }

    fn child_or_insert(&mut self, byte: u8) -> &mut Node {
        if let Some(at) = self.children.iter().position(|(b, _)| *b == byte) {
            &mut self.children[at].1
        } else {
            self.children.push((byte, Node::new()));
            &mut self.children.last_mut().unwrap().1
        }
    }
}

/// A successful lookup: the route entry plus the captured parameters.
/// Parameter names borrow the trie, values borrow the request path; the
/// dispatcher copies both into the request arena before releasing the
/// read lock.
pub struct RouteMatch<'t, 'p> {
    pub entry: RouteEntry,
    pub params: ArrayVec<(&'t str, &'p str), MAX_PARAMS>,
}

pub struct RouteTrie {
    root: Node,
    route_count: usize,
}

impl RouteTrie {
    pub fn new() -> RouteTrie {
        RouteTrie {
            root: Node::new(),
            route_count: 0,
        }
    }

    /// Number of registered `(path, method)` entries.
    pub fn route_count(&self) -> usize {
        self.route_count
    }

    /// Registers `entry` for `method` under `path`.
    ///
    /// `:name` installs a parameter segment, `*` a terminal wildcard.
    /// Registering the same `(path, method)` twice replaces the entry.
    pub fn add(&mut self, method: Method, path: &str, entry: RouteEntry) {
        let mut current = &mut self.root;
        let mut rest = path.strip_prefix('/').unwrap_or(path).as_bytes();

        while !rest.is_empty() {
            match rest[0] {
                b':' => {
                    let end = rest.iter().position(|&b| b == b'/').unwrap_or(rest.len());
                    let name = std::str::from_utf8(&rest[1..end]).unwrap_or_default();

                    let child = current.param_child.get_or_insert_with(|| {
                        let mut node = Node::new();
                        node.param_name = Some(name.into());
                        Box::new(node)
                    });
                    current = child;
                    rest = &rest[end..];
                }
                b'*' => {
                    current = current
                        .wildcard_child
                        .get_or_insert_with(|| Box::new(Node::new()));
                    // A wildcard swallows the remainder of the pattern.
                    rest = &[];
                }
                _ => {
                    let end = rest.iter().position(|&b| b == b'/').unwrap_or(rest.len());
                    for &byte in &rest[..end] {
                        current = current.child_or_insert(byte);
                    }
                    rest = &rest[end..];
                }
            }

            if let Some((b'/', tail)) = rest.split_first() {
                current = current.child_or_insert(b'/');
                rest = tail;
            }
        }

        current.is_end = true;
        if current.entries[method.index()].replace(entry).is_none() {
            self.route_count += 1;
        }
    }

    /// Looks up `segments` (from [`tokenize_path`]) for `method`.
    pub fn find<'t, 'p>(
        &'t self,
        method: Method,
        segments: &[&'p str],
    ) -> Option<RouteMatch<'t, 'p>> {
        let mut params = ArrayVec::new();

        let node = if segments.is_empty() {
            self.root.is_end.then_some(&self.root)
        } else {
            match_segments(&self.root, segments, 0, &mut params)
        }?;

        let entry = node.entries[method.index()].clone()?;
        Some(RouteMatch { entry, params })
    }
}

impl Default for RouteTrie {
    fn default() -> RouteTrie {
        RouteTrie::new()
    }
}

fn match_segments<'t, 'p>(
    node: &'t Node,
    segments: &[&'p str],
    index: usize,
    params: &mut ArrayVec<(&'t str, &'p str), MAX_PARAMS>,
) -> Option<&'t Node> {
    debug_assert!(index < segments.len());
    let segment = segments[index];
    let last = index + 1 >= segments.len();

    // Exact byte match first.
    let mut current = Some(node);
    for &byte in segment.as_bytes() {
        current = current.and_then(|n| n.child(byte));
    }
    if let Some(exact) = current {
        if last {
            if exact.is_end {
                return Some(exact);
            }
        } else if let Some(sep) = exact.child(b'/') {
            if let Some(found) = match_segments(sep, segments, index + 1, params) {
                return Some(found);
            }
        }
    }

    // Then a parameter capture.
    if let Some(param) = node.param_child.as_deref() {
        let name = param.param_name.as_deref().unwrap_or_default();
        if params.try_push((name, segment)).is_ok() {
            if last {
                if param.is_end {
                    return Some(param);
                }
            } else if let Some(sep) = param.child(b'/') {
                if let Some(found) = match_segments(sep, segments, index + 1, params) {
                    return Some(found);
                }
            }
            // Undo the capture before falling through.
            params.pop();
        }
    }

    // Finally the wildcard, which accepts the remainder.
    match node.wildcard_child.as_deref() {
        Some(wildcard) if wildcard.is_end => Some(wildcard),
        _ => None,
    }
}
