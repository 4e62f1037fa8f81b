// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! An embeddable HTTP/1.1 server core.
//!
//! ecewo is the request-lifecycle engine for building request/response
//! services: it accepts TCP connections, parses requests incrementally,
//! routes them through an ordered middleware chain to your handlers, and
//! writes the responses back, all on a single-threaded event loop, with
//! a worker pool for blocking jobs.
//!
//! # Overview
//!
//! - **Routing**: a radix trie with `:param` captures and terminal `*`
//!   wildcards, one handler per `(path, method)`.
//! - **Middleware**: `(req, res, next)` interceptors; skipping `next`
//!   short-circuits, and `next` can be captured and resumed from a
//!   worker completion for asynchronous middleware.
//! - **Bodies**: buffered into the request arena by default, or
//!   streamed chunk-by-chunk by opting in with the
//!   [`body_stream`] middleware, with a running size cap.
//! - **Memory**: each request's strings live in a pooled bump arena
//!   that is rewound between requests instead of freed.
//! - **Workers**: [`spawn_http`] runs blocking work off-loop and hands
//!   the result back to the connection, which stays alive for exactly
//!   as long as anything references it.
//! - **Lifecycle**: graceful shutdown on SIGINT/SIGTERM (or
//!   [`Server::shutdown`]) that stops accepting, drains workers and
//!   in-flight requests, then force-closes stragglers.
//!
//! # Example
//!
//! ```no_run
//! use ecewo::{Server, status};
//!
//! let server = Server::new().unwrap();
//!
//! server.get("/users/:id", |req, res| {
//!     let id = req.param("id").unwrap_or("?").to_owned();
//!     res.send_text(status::OK, format!("user {id}"));
//! });
//!
//! server.listen(8080).unwrap();
//! server.run();
//! ```
//!
//! Handlers and middleware always run on the reactor thread; blocking
//! work belongs on the worker pool:
//!
//! ```no_run
//! use ecewo::{spawn_http, status, Server};
//!
//! let server = Server::new().unwrap();
//! server.get("/report", |_req, res| {
//!     spawn_http(
//!         res,
//!         || {
//!             // Runs on a worker thread.
//!             "42 rows".to_owned()
//!         },
//!         |_req, res, rows| {
//!             // Back on the reactor thread.
//!             res.send_text(status::OK, rows);
//!         },
//!     );
//! });
//! ```
//!
//! # Environment
//!
//! - `ECEWO_WORKER=1`: cluster-worker mode: no signal handlers, no
//!   startup banner.
//! - `ECEWO_TEST_MODE=1`: disables `SO_REUSEPORT` so overlapping test
//!   binds fail loudly.

pub use crate::body::{body_limit, body_on_data, body_on_end};
pub use crate::connection::TakenConnection;
pub use crate::middleware::{body_stream, middleware, Middleware, Next};
pub use crate::reactor::Timer;
pub use crate::request::Req;
pub use crate::response::{reason_phrase, status, Res};
pub use crate::router::Method;
pub use crate::server::{
    connection_takeover, request_timeout, spawn_http, LoopHandle, Server, ServerError,
    ShutdownHandle, TakeoverConfig, TakeoverError,
};

mod arena;
mod body;
mod connection;
mod date;
mod http1;
mod middleware;
mod reactor;
mod request;
mod response;
mod router;
mod server;

/// Hard cap on concurrently open connections.
pub const MAX_CONNECTIONS: usize = 10_000;

/// Listen backlog passed to the OS.
pub const LISTEN_BACKLOG: u32 = 511;

/// Keep-alive connections idle longer than this are swept.
pub const IDLE_TIMEOUT_MS: u64 = 60_000;

/// Per-request timeout armed at request start; `0` disables it.
/// Handlers can arm one explicitly with [`request_timeout`].
pub const REQUEST_TIMEOUT_MS: u64 = 0;

/// How often the idle-connection sweeper runs.
pub const CLEANUP_INTERVAL_MS: u64 = 30_000;

/// Budget for each graceful-shutdown drain phase.
pub const SHUTDOWN_TIMEOUT_MS: u64 = 15_000;

/// Cap on buffered request bodies, and the default streaming cap.
pub const BODY_MAX_SIZE: usize = 10 * 1024 * 1024;

/// Size of the fixed per-connection read buffer.
pub const READ_BUFFER_SIZE: usize = 4096;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::arena::Arena;
    use crate::date::DateCache;
    use crate::http1::{HttpContext, ParseOutcome};
    use crate::request::Req;
    use crate::response::Res;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A detached request/response pair for chain and body tests; the
    /// response captures its wire output instead of writing to a socket.
    pub fn req_res() -> (Req, Res) {
        req_res_for(b"GET /test HTTP/1.1\r\nHost: test\r\n\r\n")
    }

    pub fn req_res_for(wire: &[u8]) -> (Req, Res) {
        let mut arena = Arena::new();
        let mut ctx = HttpContext::new(crate::BODY_MAX_SIZE);
        match ctx.feed(&mut arena, wire, None) {
            ParseOutcome::Paused { .. } => {}
            other => panic!("test request did not parse: {other:?}"),
        }
        let req = Req::from_context(arena, &mut ctx);
        let res = Res::capture(Rc::new(DateCache::new()), Rc::new(RefCell::new(Vec::new())));
        (req, res)
    }
}
