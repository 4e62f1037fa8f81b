// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Opt-in body streaming.
//!
//! By default the parser buffers the whole request body before the
//! handler runs. Putting [`body_stream`](crate::middleware::body_stream)
//! into a middleware list flips the request to streaming mode: the
//! dispatcher points the parser's chunk sink here, every body slice is
//! forwarded to the `body_on_data` callback as it arrives, and
//! `body_on_end` fires exactly once at message end. In this mode the
//! buffered accessors (`Req::body_bytes`/`Req::body_len`) return
//! `None`/`0` for the whole request.
//!
//! The stream state lives in the request's context store under a
//! reserved key, like any other middleware state.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::middleware::Next;
use crate::request::Req;
use crate::response::Res;
use crate::BODY_MAX_SIZE;

const STREAM_CTX_KEY: &str = "_body_stream";

/// Per-request streaming state.
struct StreamCtx {
    enabled: Cell<bool>,
    max_size: Cell<usize>,
    bytes_received: Cell<usize>,
    completed: Cell<bool>,
    on_data: RefCell<Option<Rc<dyn Fn(&mut Req, &[u8])>>>,
    on_end: RefCell<Option<Rc<dyn Fn(&mut Req, &mut Res)>>>,
}

impl StreamCtx {
    fn new() -> StreamCtx {
        StreamCtx {
            enabled: Cell::new(false),
            max_size: Cell::new(BODY_MAX_SIZE),
            bytes_received: Cell::new(0),
            completed: Cell::new(false),
            on_data: RefCell::new(None),
            on_end: RefCell::new(None),
        }
    }
}

fn ctx(req: &Req) -> Option<Rc<StreamCtx>> {
    req.context::<StreamCtx>(STREAM_CTX_KEY)
}

fn ctx_or_create(req: &mut Req) -> Rc<StreamCtx> {
    if let Some(existing) = ctx(req) {
        return existing;
    }
    let created = Rc::new(StreamCtx::new());
    req.set_context_rc(STREAM_CTX_KEY, created.clone());
    created
}

/// Body of the `body_stream` middleware; invoked by the chain when it
/// reaches the `Middleware::BodyStream` marker.
pub(crate) fn run_body_stream(req: &mut Req, res: &mut Res, next: Next) {
    let ctx = ctx_or_create(req);
    ctx.enabled.set(true);
    req.set_streaming();
    next.run(req, res);
}

/// Registers the per-chunk callback. Requires the `body_stream`
/// middleware on the route (or globally); without it the call is refused
/// and logged.
pub fn body_on_data<F>(req: &mut Req, callback: F)
where
    F: Fn(&mut Req, &[u8]) + 'static,
{
    let ctx = ctx_or_create(req);
    if !ctx.enabled.get() {
        log::error!("body_on_data requires the body_stream middleware");
        return;
    }
    *ctx.on_data.borrow_mut() = Some(Rc::new(callback));
}

/// Registers the end-of-body callback, fired exactly once when the
/// message completes. If the body already finished (it was empty, or
/// fully arrived with the head) the callback runs immediately.
pub fn body_on_end<F>(req: &mut Req, res: &mut Res, callback: F)
where
    F: Fn(&mut Req, &mut Res) + 'static,
{
    let ctx = ctx_or_create(req);
    *ctx.on_end.borrow_mut() = Some(Rc::new(callback));

    if ctx.completed.get() {
        let cb = ctx.on_end.borrow().clone();
        if let Some(cb) = cb {
            cb(req, res);
        }
    }
}

/// Updates the running byte cap for this request's stream and returns
/// the previous value. Passing `0` restores the default
/// [`BODY_MAX_SIZE`](crate::BODY_MAX_SIZE).
pub fn body_limit(req: &mut Req, max_size: usize) -> usize {
    let ctx = ctx_or_create(req);
    let previous = ctx.max_size.get();
    ctx.max_size.set(if max_size == 0 { BODY_MAX_SIZE } else { max_size });
    previous
}

/// Parser sink: forwards one body slice to the user callback.
///
/// Returns `false` once the running cap is exceeded, which aborts the
/// parse with an overflow and a 413.
pub(crate) fn stream_deliver(req: &mut Req, chunk: &[u8]) -> bool {
    let Some(ctx) = ctx(req) else {
        return true;
    };

    let total = ctx.bytes_received.get() + chunk.len();
    if total > ctx.max_size.get() {
        return false;
    }
    ctx.bytes_received.set(total);

    let cb = ctx.on_data.borrow().clone();
    if let Some(cb) = cb {
        cb(req, chunk);
    }
    true
}

/// Dispatcher hook at `MESSAGE_COMPLETE` in streaming mode.
pub(crate) fn stream_complete(req: &mut Req, res: &mut Res) {
    let Some(ctx) = ctx(req) else {
        return;
    };
    if ctx.completed.replace(true) {
        return;
    }
    let cb = ctx.on_end.borrow().clone();
    if let Some(cb) = cb {
        cb(req, res);
    }
}
