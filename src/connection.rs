// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Per-connection state and the request dispatcher.
//!
//! Every read delivery runs through [`on_readable`]: bytes feed the
//! parser, the headers-complete pause hands control to the dispatcher,
//! which routes the request, decides buffered vs streaming delivery and
//! drives the middleware chain. The resume bookkeeping is strict: after
//! a pause only the unconsumed suffix of the read buffer is fed back,
//! never the whole buffer.
//!
//! A connection's lifetime is governed by its `Rc` strong count: the
//! slab entry, queued timers and in-flight dispatch steps each hold one
//! handle, plus the `valid`/`closing` flags that gate late writes.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::rc::Rc;
use std::time::Instant;

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::arena::Arena;
use crate::body;
use crate::http1::{HttpContext, ParseOutcome};
use crate::middleware::{chain_start, ChainInfo, Handler};
use crate::request::Req;
use crate::response::{error_response, status, Res};
use crate::router::{tokenize_path, Method, RouteMatch, MAX_PARAMS};
use crate::server::ServerInner;
use crate::{Timer, BODY_MAX_SIZE, READ_BUFFER_SIZE, REQUEST_TIMEOUT_MS};

/// What the dispatcher tells the reactor after a read delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchAction {
    /// Request finished, connection stays open for the next one.
    KeepAlive,
    /// Initiate connection close.
    Close,
    /// Waiting: more bytes, a worker completion, or a timer.
    Pending,
}

/// A request parked between reactor turns.
enum PendingDispatch {
    /// Headers dispatched in buffered mode, body still flowing; the
    /// chain starts once the message completes.
    AwaitBody {
        req: Req,
        res: Res,
        chain: Rc<ChainInfo>,
    },
    /// Streaming mode: chain already ran, chunks flow to callbacks.
    Streaming { req: Req, res: Res },
    /// Replied at headers-dispatch (404 and friends) with body bytes
    /// still on the wire; they are consumed and discarded.
    Drain { req: Req, res: Res },
    /// Handler returned without replying; a worker or timer will.
    AwaitReply { req: Req, res: Res },
}

pub(crate) type DoneFn = Box<dyn FnOnce(&mut Req, &mut Res, Box<dyn Any + Send>)>;

pub(crate) struct Connection {
    pub(crate) id: u64,
    pub(crate) token: usize,
    pub(crate) stream: TcpStream,

    read_buf: Option<Box<[u8]>>,
    write_queue: VecDeque<Vec<u8>>,
    write_pos: usize,
    interest: Interest,

    pub(crate) arena: Option<Arena>,
    ctx: Option<HttpContext>,

    pub(crate) valid: bool,
    pub(crate) closing: bool,
    pub(crate) keep_alive_enabled: bool,
    pub(crate) request_in_progress: bool,
    pub(crate) taken_over: bool,

    pub(crate) last_activity: Instant,
    pub(crate) request_timer: Option<Timer>,

    pending: Option<PendingDispatch>,
    pub(crate) done_queue: VecDeque<DoneFn>,
    /// Bytes that arrived while a request was still awaiting its reply;
    /// HTTP/1.1 pipelining is serialized, so they wait their turn.
    leftover: Vec<u8>,

    takeover_cb: Option<Box<dyn FnMut(&TakenConnection, &[u8])>>,
}

impl Connection {
    pub(crate) fn new(id: u64, token: usize, stream: TcpStream, arena: Arena) -> Connection {
        Connection {
            id,
            token,
            stream,
            read_buf: Some(vec![0u8; READ_BUFFER_SIZE].into_boxed_slice()),
            write_queue: VecDeque::new(),
            write_pos: 0,
            interest: Interest::READABLE,
            arena: Some(arena),
            ctx: None,
            valid: true,
            closing: false,
            keep_alive_enabled: false,
            request_in_progress: false,
            taken_over: false,
            last_activity: Instant::now(),
            request_timer: None,
            pending: None,
            done_queue: VecDeque::new(),
            leftover: Vec::new(),
            takeover_cb: None,
        }
    }

    fn has_queued_writes(&self) -> bool {
        !self.write_queue.is_empty()
    }
}

/// A reference to a live connection, held by responses, worker bridges
/// and takeover owners. The strong count is the connection's refcount.
#[derive(Clone)]
pub(crate) struct ClientHandle {
    pub(crate) conn: Rc<RefCell<Connection>>,
    pub(crate) server: Rc<ServerInner>,
}

impl ClientHandle {
    pub(crate) fn shared(&self) -> &ServerInner {
        &self.server
    }

    /// The "client is valid and writable" gate: late responses are
    /// dropped once close has been initiated.
    pub(crate) fn valid_for_write(&self) -> bool {
        let conn = self.conn.borrow();
        conn.valid && !conn.closing
    }

    pub(crate) fn queue_write(&self, buffer: Vec<u8>) {
        queue_write(&self.server, &self.conn, buffer);
    }
}

/// Write/close handle given to a connection-takeover owner.
pub struct TakenConnection {
    pub(crate) client: ClientHandle,
}

impl TakenConnection {
    /// Queues raw bytes on the socket.
    pub fn send(&self, bytes: &[u8]) {
        if self.client.valid_for_write() {
            self.client.queue_write(bytes.to_vec());
        }
    }

    /// Closes the connection once queued writes have flushed.
    pub fn close(&self) {
        close_client(&self.client.server, &self.client.conn);
    }

    /// The connection's monotonic id.
    pub fn id(&self) -> u64 {
        self.client.conn.borrow().id
    }
}

impl Clone for TakenConnection {
    fn clone(&self) -> TakenConnection {
        TakenConnection {
            client: self.client.clone(),
        }
    }
}

/// Outcome of one dispatch step over a byte slice.
enum StepResult {
    /// All input consumed; the parser needs more bytes.
    NeedMore,
    /// The request is parked; `consumed` bytes were used, the rest must
    /// wait in the leftover buffer.
    Parked { consumed: usize },
    /// Request complete. Unconsumed bytes belong to the next request.
    Finished { consumed: usize, keep_alive: bool },
    /// Protocol or contract failure; connection must close.
    Fatal,
}

/// Readable-event entry point.
pub(crate) fn on_readable(server: &Rc<ServerInner>, token: usize) {
    let Some(conn_rc) = server.connection(token) else {
        return;
    };

    loop {
        // Read phase, under a short borrow.
        let (mut buf, n) = {
            let mut conn = conn_rc.borrow_mut();
            if conn.closing {
                return;
            }
            if server.shutdown_requested.get() {
                drop(conn);
                close_client(server, &conn_rc);
                return;
            }

            let mut buf = conn
                .read_buf
                .take()
                .unwrap_or_else(|| vec![0u8; READ_BUFFER_SIZE].into_boxed_slice());

            match conn.stream.read(&mut buf[..]) {
                Ok(0) => {
                    conn.read_buf = Some(buf);
                    drop(conn);
                    close_client(server, &conn_rc);
                    return;
                }
                Ok(n) => {
                    conn.last_activity = Instant::now();
                    (buf, n)
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    conn.read_buf = Some(buf);
                    return;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    conn.read_buf = Some(buf);
                    continue;
                }
                Err(e) => {
                    log::debug!("read error on connection {}: {e}", conn.id);
                    conn.read_buf = Some(buf);
                    drop(conn);
                    close_client(server, &conn_rc);
                    return;
                }
            }
        };

        // Dispatch phase, with the connection borrowable by handlers.
        let taken_over = conn_rc.borrow().taken_over;
        let action = if taken_over {
            takeover_deliver(server, &conn_rc, &buf[..n]);
            DispatchAction::Pending
        } else {
            dispatch(server, &conn_rc, &buf[..n])
        };

        conn_rc.borrow_mut().read_buf = Some(buf);

        match action {
            DispatchAction::KeepAlive => {}
            DispatchAction::Pending => {}
            DispatchAction::Close => {
                close_client(server, &conn_rc);
                return;
            }
        }
    }
}

/// Runs the parser/dispatch state machine over one read delivery,
/// looping for pipelined requests.
fn dispatch(server: &Rc<ServerInner>, conn_rc: &Rc<RefCell<Connection>>, data: &[u8]) -> DispatchAction {
    let mut rest = data;

    loop {
        // A request still awaiting its reply serializes pipelining.
        {
            let mut conn = conn_rc.borrow_mut();
            if conn.closing {
                return DispatchAction::Close;
            }
            if matches!(conn.pending, Some(PendingDispatch::AwaitReply { .. })) {
                conn.leftover.extend_from_slice(rest);
                return DispatchAction::Pending;
            }
        }

        match step(server, conn_rc, rest) {
            StepResult::NeedMore => return DispatchAction::Pending,
            StepResult::Parked { consumed } => {
                let tail = &rest[consumed.min(rest.len())..];
                if !tail.is_empty() {
                    conn_rc.borrow_mut().leftover.extend_from_slice(tail);
                }
                return DispatchAction::Pending;
            }
            StepResult::Fatal => return DispatchAction::Close,
            StepResult::Finished { consumed, keep_alive } => {
                if !keep_alive {
                    return DispatchAction::Close;
                }
                conn_rc.borrow_mut().keep_alive_enabled = true;
                rest = &rest[consumed.min(rest.len())..];
                if rest.is_empty() {
                    return DispatchAction::KeepAlive;
                }
            }
        }
    }
}

fn step(server: &Rc<ServerInner>, conn_rc: &Rc<RefCell<Connection>>, input: &[u8]) -> StepResult {
    // Continue a parked request first.
    let has_pending = conn_rc.borrow().pending.is_some();
    if has_pending {
        let Some(mut ctx) = conn_rc.borrow_mut().ctx.take() else {
            return StepResult::Fatal;
        };
        let result = feed_pending(server, conn_rc, &mut ctx, input, 0);
        conn_rc.borrow_mut().ctx = Some(ctx);
        return result;
    }

    // Otherwise this is head material: a new request, or more head
    // bytes for one already in progress.
    let starting = {
        let mut conn = conn_rc.borrow_mut();
        let starting = !conn.request_in_progress;
        if starting {
            conn.request_in_progress = true;
            match conn.ctx.as_mut() {
                Some(ctx) => ctx.reset(),
                None => conn.ctx = Some(HttpContext::new(BODY_MAX_SIZE)),
            }
            match conn.arena.as_mut() {
                Some(arena) => arena.reset(),
                None => conn.arena = Some(server.pool.borrow_mut().borrow()),
            }
        }
        starting
    };
    if starting && REQUEST_TIMEOUT_MS > 0 {
        arm_request_timer(server, conn_rc, REQUEST_TIMEOUT_MS);
    }

    let (mut ctx, mut arena) = {
        let mut conn = conn_rc.borrow_mut();
        match (conn.ctx.take(), conn.arena.take()) {
            (Some(ctx), Some(arena)) => (ctx, arena),
            (ctx, arena) => {
                conn.ctx = ctx;
                conn.arena = arena;
                log::error!("connection {} lost its parse state", conn.id);
                return StepResult::Fatal;
            }
        }
    };

    let outcome = ctx.feed(&mut arena, input, None);
    let result = match outcome {
        ParseOutcome::Incomplete => {
            let mut conn = conn_rc.borrow_mut();
            conn.arena = Some(arena);
            StepResult::NeedMore
        }
        ParseOutcome::Overflow => {
            log::error!("request too large: {}", ctx.error_reason.unwrap_or("overflow"));
            send_canned(server, conn_rc, status::PAYLOAD_TOO_LARGE);
            arena.reset();
            conn_rc.borrow_mut().arena = Some(arena);
            StepResult::Fatal
        }
        ParseOutcome::Error | ParseOutcome::Success { .. } => {
            log::error!("parse error: {}", ctx.error_reason.unwrap_or("malformed request"));
            send_canned(server, conn_rc, status::BAD_REQUEST);
            arena.reset();
            conn_rc.borrow_mut().arena = Some(arena);
            StepResult::Fatal
        }
        ParseOutcome::Paused { consumed } => {
            route_and_run(server, conn_rc, &mut ctx, arena, consumed, &input[consumed..])
        }
    };

    conn_rc.borrow_mut().ctx = Some(ctx);
    result
}

/// Headers are complete: build `Req`/`Res`, route, pick the delivery
/// mode, run or park the chain, then resume the parser on `remainder`.
fn route_and_run(
    server: &Rc<ServerInner>,
    conn_rc: &Rc<RefCell<Connection>>,
    ctx: &mut HttpContext,
    arena: Arena,
    head_consumed: usize,
    remainder: &[u8],
) -> StepResult {
    let keep_alive = ctx.keep_alive;
    let mut req = Req::from_context(arena, ctx);
    let client = ClientHandle {
        conn: conn_rc.clone(),
        server: server.clone(),
    };
    let mut res = Res::new(client, keep_alive, req.is_head_request());

    // Route lookup, copying captures out before the read lock drops.
    let mut found = None;
    {
        let method = Method::from_token(req.method());
        if let (Some(method), Some(segments)) = (method, tokenize_path(req.path())) {
            let trie = server.read_routes();
            let route_match = trie.find(method, &segments);
            if let Some(RouteMatch { entry, params }) = route_match {
                let params: arrayvec::ArrayVec<(Box<str>, Box<str>), MAX_PARAMS> = params
                    .iter()
                    .map(|(k, v)| (Box::from(*k), Box::from(*v)))
                    .collect();
                found = Some((entry.middleware.clone(), entry.handler.clone(), params));
            }
        }
    }

    let chain = match found {
        Some((middleware, handler, params)) => {
            for (name, value) in &params {
                req.push_param(name, value);
            }
            Rc::new(ChainInfo::new(
                server.global_middleware(),
                middleware,
                handler,
            ))
        }
        None => {
            // OPTIONS preflight: let the global chain (e.g. CORS) answer
            // before falling back to 404.
            if req.method() == "OPTIONS" {
                let noop: Handler = Rc::new(|_req: &mut Req, _res: &mut Res| {});
                let chain = Rc::new(ChainInfo::new(
                    server.global_middleware(),
                    Rc::from([]),
                    noop,
                ));
                chain_start(chain, &mut req, &mut res);
            }
            if !res.replied() {
                res.set_header("Content-Type", "text/plain");
                res.reply(status::NOT_FOUND, "404 Not Found");
            }
            return settle(server, conn_rc, ctx, req, res, head_consumed, remainder);
        }
    };

    let has_stream = chain.has_body_stream();
    let has_body = ctx.has_body();

    // Oversize guard: without a streaming middleware, chunked bodies and
    // anything at or above the buffered cap are refused before a single
    // body byte is read. The parser is mid-message; never resume after
    // this response.
    if !has_stream
        && has_body
        && (ctx.chunked || ctx.content_length.unwrap_or(0) >= BODY_MAX_SIZE as u64)
    {
        res.set_close();
        res.set_header("Content-Type", "text/plain");
        res.reply(status::PAYLOAD_TOO_LARGE, "Payload Too Large");
        end_request(server, conn_rc, req);
        return StepResult::Fatal;
    }

    if !has_stream {
        if has_body {
            // Buffered mode with the body still in flight: stash the
            // dispatch and let the parser consume the remainder.
            conn_rc.borrow_mut().pending = Some(PendingDispatch::AwaitBody { req, res, chain });
            return feed_pending(server, conn_rc, ctx, remainder, head_consumed);
        }

        // No body at all: run the chain right away.
        chain_start(chain, &mut req, &mut res);
        return settle(server, conn_rc, ctx, req, res, head_consumed, remainder);
    }

    // Streaming: run the chain first so `body_stream` can flip the mode
    // and the handler can register its callbacks, then feed body bytes.
    chain_start(chain, &mut req, &mut res);

    if ctx.message_complete {
        body::stream_complete(&mut req, &mut res);
        return settle(server, conn_rc, ctx, req, res, head_consumed, remainder);
    }

    conn_rc.borrow_mut().pending = Some(PendingDispatch::Streaming { req, res });
    feed_pending(server, conn_rc, ctx, remainder, head_consumed)
}

/// Continues a parked request with freshly arrived bytes.
fn feed_pending(
    server: &Rc<ServerInner>,
    conn_rc: &Rc<RefCell<Connection>>,
    ctx: &mut HttpContext,
    input: &[u8],
    base_consumed: usize,
) -> StepResult {
    let Some(pending) = conn_rc.borrow_mut().pending.take() else {
        return StepResult::Fatal;
    };

    match pending {
        PendingDispatch::AwaitBody { mut req, mut res, chain } => {
            match ctx.feed_body(input, None) {
                ParseOutcome::Incomplete => {
                    conn_rc.borrow_mut().pending =
                        Some(PendingDispatch::AwaitBody { req, res, chain });
                    StepResult::NeedMore
                }
                ParseOutcome::Success { consumed } => {
                    if !ctx.body.is_empty() {
                        req.attach_body(&ctx.body);
                    }
                    chain_start(chain, &mut req, &mut res);
                    settle_complete(server, conn_rc, req, res, base_consumed + consumed)
                }
                ParseOutcome::Overflow => {
                    log::error!("body too large: {}", ctx.error_reason.unwrap_or(""));
                    send_canned(server, conn_rc, status::PAYLOAD_TOO_LARGE);
                    end_request(server, conn_rc, req);
                    StepResult::Fatal
                }
                ParseOutcome::Error | ParseOutcome::Paused { .. } => {
                    log::error!(
                        "parse error after resume: {}",
                        ctx.error_reason.unwrap_or("unknown")
                    );
                    send_canned(server, conn_rc, status::BAD_REQUEST);
                    end_request(server, conn_rc, req);
                    StepResult::Fatal
                }
            }
        }

        PendingDispatch::Streaming { mut req, mut res } => {
            let outcome = {
                let mut sink = |chunk: &[u8]| body::stream_deliver(&mut req, chunk);
                ctx.feed_body(input, Some(&mut sink))
            };
            match outcome {
                ParseOutcome::Incomplete => {
                    conn_rc.borrow_mut().pending = Some(PendingDispatch::Streaming { req, res });
                    StepResult::NeedMore
                }
                ParseOutcome::Success { consumed } => {
                    body::stream_complete(&mut req, &mut res);
                    settle_complete(server, conn_rc, req, res, base_consumed + consumed)
                }
                ParseOutcome::Overflow => {
                    log::error!("streaming body over limit");
                    send_canned(server, conn_rc, status::PAYLOAD_TOO_LARGE);
                    end_request(server, conn_rc, req);
                    StepResult::Fatal
                }
                ParseOutcome::Error | ParseOutcome::Paused { .. } => {
                    send_canned(server, conn_rc, status::BAD_REQUEST);
                    end_request(server, conn_rc, req);
                    StepResult::Fatal
                }
            }
        }

        PendingDispatch::Drain { req, res } => {
            let outcome = {
                let mut sink = |_chunk: &[u8]| true;
                ctx.feed_body(input, Some(&mut sink))
            };
            match outcome {
                ParseOutcome::Incomplete => {
                    conn_rc.borrow_mut().pending = Some(PendingDispatch::Drain { req, res });
                    StepResult::NeedMore
                }
                ParseOutcome::Success { consumed } => {
                    settle_complete(server, conn_rc, req, res, base_consumed + consumed)
                }
                _ => {
                    end_request(server, conn_rc, req);
                    StepResult::Fatal
                }
            }
        }

        PendingDispatch::AwaitReply { req, res } => {
            // Callers park new bytes in `leftover` instead.
            conn_rc.borrow_mut().pending = Some(PendingDispatch::AwaitReply { req, res });
            StepResult::Parked { consumed: 0 }
        }
    }
}

/// Decides what happens after the chain ran at headers-dispatch time:
/// the body may be absent, still on the wire, or already replied-over.
fn settle(
    server: &Rc<ServerInner>,
    conn_rc: &Rc<RefCell<Connection>>,
    ctx: &mut HttpContext,
    req: Req,
    res: Res,
    head_consumed: usize,
    remainder: &[u8],
) -> StepResult {
    if ctx.message_complete {
        return settle_complete(server, conn_rc, req, res, head_consumed);
    }

    if !res.replied() {
        // Streaming chain that neither replied nor finished its body is
        // handled by the Streaming pending; anything else lands here
        // only in contract-failure territory.
        conn_rc.borrow_mut().pending = Some(PendingDispatch::AwaitReply { req, res });
        return StepResult::Parked { consumed: head_consumed };
    }

    // Replied while body bytes are still inbound (404 on a POST, CORS
    // preflight and similar). Small declared bodies are drained so
    // keep-alive survives; anything else closes.
    let drainable = !ctx.chunked && ctx.content_length.unwrap_or(0) < BODY_MAX_SIZE as u64;
    if !drainable {
        end_request(server, conn_rc, req);
        return StepResult::Fatal;
    }

    conn_rc.borrow_mut().pending = Some(PendingDispatch::Drain { req, res });
    feed_pending(server, conn_rc, ctx, remainder, head_consumed)
}

/// The message is fully parsed and the chain has run: either finish the
/// request or park it until a worker replies.
fn settle_complete(
    server: &Rc<ServerInner>,
    conn_rc: &Rc<RefCell<Connection>>,
    req: Req,
    res: Res,
    consumed: usize,
) -> StepResult {
    if !res.replied() {
        conn_rc.borrow_mut().pending = Some(PendingDispatch::AwaitReply { req, res });
        return StepResult::Parked { consumed };
    }

    let keep_alive = res.keep_alive();
    end_request(server, conn_rc, req);
    StepResult::Finished { consumed, keep_alive }
}

/// Ends a request: rewinds and reclaims the arena, stops the request
/// timer, clears bookkeeping. The connection decides keep-alive next.
pub(crate) fn end_request(server: &Rc<ServerInner>, conn_rc: &Rc<RefCell<Connection>>, req: Req) {
    let mut arena = req.into_arena();
    arena.reset();

    let mut conn = conn_rc.borrow_mut();
    conn.arena = Some(arena);
    conn.request_in_progress = false;

    if let Some(timer) = conn.request_timer.take() {
        server.timers.borrow_mut().cancel(timer);
    }
    if !conn.done_queue.is_empty() {
        log::debug!(
            "connection {}: {} worker done-callback(s) orphaned at request end",
            conn.id,
            conn.done_queue.len()
        );
        conn.done_queue.clear();
    }
}

/// Runs a worker done-callback delivered by the completion channel.
pub(crate) fn handle_http_completion(
    server: &Rc<ServerInner>,
    token: usize,
    conn_id: u64,
    payload: Box<dyn Any + Send>,
) {
    let Some(conn_rc) = server.connection(token) else {
        log::debug!("worker completion for a closed connection, skipped");
        return;
    };

    // Guard against slab token reuse and post-close delivery.
    let (stale, invalid) = {
        let conn = conn_rc.borrow();
        (conn.id != conn_id, !conn.valid || conn.closing)
    };
    if stale || invalid {
        log::debug!("worker completion skipped: connection gone or closing");
        return;
    }

    let pending = conn_rc.borrow_mut().pending.take();
    let (mut req, mut res) = match pending {
        Some(PendingDispatch::AwaitReply { req, res }) => (req, res),
        other => {
            // The request is not awaiting a worker; put any other parked
            // state back untouched.
            if let Some(other) = other {
                conn_rc.borrow_mut().pending = Some(other);
            }
            return;
        }
    };

    let done = conn_rc.borrow_mut().done_queue.pop_front();
    if let Some(done) = done {
        done(&mut req, &mut res, payload);
    }

    if !res.replied() {
        conn_rc.borrow_mut().pending = Some(PendingDispatch::AwaitReply { req, res });
        return;
    }

    let keep_alive = res.keep_alive();
    end_request(server, &conn_rc, req);

    if !keep_alive {
        close_client(server, &conn_rc);
        return;
    }
    conn_rc.borrow_mut().keep_alive_enabled = true;

    // Pipelined bytes may have queued up behind the async request.
    let leftover = std::mem::take(&mut conn_rc.borrow_mut().leftover);
    if !leftover.is_empty() {
        if dispatch(server, &conn_rc, &leftover) == DispatchAction::Close {
            close_client(server, &conn_rc);
        }
    }
}

/// Formats and queues a canned error response.
fn send_canned(server: &Rc<ServerInner>, conn_rc: &Rc<RefCell<Connection>>, code: u16) {
    let buffer = error_response(code, &server.date);
    queue_write(server, conn_rc, buffer);
}

/// Queues bytes on the connection and flushes opportunistically.
pub(crate) fn queue_write(server: &Rc<ServerInner>, conn_rc: &Rc<RefCell<Connection>>, buffer: Vec<u8>) {
    let mut conn = conn_rc.borrow_mut();
    if conn.closing {
        // Close has been initiated; only the already-queued flush runs.
        return;
    }
    conn.write_queue.push_back(buffer);
    flush_writes(server, &mut conn);
}

/// Writable-event entry point.
pub(crate) fn on_writable(server: &Rc<ServerInner>, token: usize) {
    let Some(conn_rc) = server.connection(token) else {
        return;
    };

    let finished = {
        let mut conn = conn_rc.borrow_mut();
        flush_writes(server, &mut conn);
        conn.closing && !conn.has_queued_writes()
    };
    if finished {
        finish_close(server, &conn_rc);
    }
}

fn flush_writes(server: &Rc<ServerInner>, conn: &mut Connection) {
    while let Some(front) = conn.write_queue.front() {
        match conn.stream.write(&front[conn.write_pos..]) {
            Ok(n) => {
                conn.write_pos += n;
                if conn.write_pos >= front.len() {
                    conn.write_queue.pop_front();
                    conn.write_pos = 0;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("write error on connection {}: {e}", conn.id);
                conn.write_queue.clear();
                conn.write_pos = 0;
                break;
            }
        }
    }

    let want = if conn.has_queued_writes() {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    if want != conn.interest {
        let token = Token(conn.token);
        if server
            .registry
            .reregister(&mut conn.stream, token, want)
            .is_ok()
        {
            conn.interest = want;
        }
    }
}

/// Initiates connection close: flips the flags, stops the request
/// timer, lets queued writes flush, then tears the connection down.
pub(crate) fn close_client(server: &Rc<ServerInner>, conn_rc: &Rc<RefCell<Connection>>) {
    {
        let mut conn = conn_rc.borrow_mut();
        if conn.closing {
            return;
        }
        conn.closing = true;
        conn.valid = false;

        if let Some(timer) = conn.request_timer.take() {
            server.timers.borrow_mut().cancel(timer);
        }

        if conn.has_queued_writes() {
            // Stop reading; on_writable completes the close after the
            // flush.
            let token = Token(conn.token);
            if server
                .registry
                .reregister(&mut conn.stream, token, Interest::WRITABLE)
                .is_ok()
            {
                conn.interest = Interest::WRITABLE;
                return;
            }
            // Could not keep the socket registered; tear down now.
        }
    }
    finish_close(server, conn_rc);
}

/// Final teardown: deregister, drop from the table, return the arena.
pub(crate) fn finish_close(server: &Rc<ServerInner>, conn_rc: &Rc<RefCell<Connection>>) {
    let token = {
        let mut conn = conn_rc.borrow_mut();
        let _ = server.registry.deregister(&mut conn.stream);

        // Reclaim the arena wherever the request left it.
        let arena = match (conn.arena.take(), conn.pending.take()) {
            (Some(arena), _) => Some(arena),
            (None, Some(pending)) => Some(
                match pending {
                    PendingDispatch::AwaitBody { req, .. }
                    | PendingDispatch::Streaming { req, .. }
                    | PendingDispatch::Drain { req, .. }
                    | PendingDispatch::AwaitReply { req, .. } => req,
                }
                .into_arena(),
            ),
            (None, None) => None,
        };
        if let Some(arena) = arena {
            server.pool.borrow_mut().give_back(arena);
        }

        conn.done_queue.clear();
        conn.takeover_cb = None;
        conn.token
    };

    server.remove_connection(token);
}

/// Delivers bytes to a takeover owner instead of the HTTP parser.
fn takeover_deliver(server: &Rc<ServerInner>, conn_rc: &Rc<RefCell<Connection>>, data: &[u8]) {
    let cb = conn_rc.borrow_mut().takeover_cb.take();
    let Some(mut cb) = cb else {
        return;
    };

    let taken = TakenConnection {
        client: ClientHandle {
            conn: conn_rc.clone(),
            server: server.clone(),
        },
    };
    cb(&taken, data);

    let mut conn = conn_rc.borrow_mut();
    if conn.takeover_cb.is_none() {
        conn.takeover_cb = Some(cb);
    }
}

/// Installs the takeover callback on the connection. Used by
/// [`crate::connection_takeover`].
pub(crate) fn install_takeover(
    conn_rc: &Rc<RefCell<Connection>>,
    cb: Option<Box<dyn FnMut(&TakenConnection, &[u8])>>,
) {
    let mut conn = conn_rc.borrow_mut();
    conn.taken_over = true;
    conn.takeover_cb = cb;
}

/// Arms (or re-arms) the per-request timeout.
pub(crate) fn arm_request_timer(
    server: &Rc<ServerInner>,
    conn_rc: &Rc<RefCell<Connection>>,
    timeout_ms: u64,
) -> bool {
    let delay = std::time::Duration::from_millis(timeout_ms);

    {
        let conn = conn_rc.borrow();
        if conn.closing {
            return false;
        }
        if let Some(timer) = conn.request_timer {
            return server.timers.borrow_mut().reschedule(timer, delay);
        }
    }

    let timer_conn = conn_rc.clone();
    let timer = server.timers.borrow_mut().schedule(
        delay,
        None,
        Rc::new(move |server: &Rc<ServerInner>| {
            log::error!("request timeout, closing connection");
            {
                let mut conn = timer_conn.borrow_mut();
                conn.request_timer = None;
                // Reset whatever the request had allocated.
                if let Some(pending) = conn.pending.take() {
                    let req = match pending {
                        PendingDispatch::AwaitBody { req, .. }
                        | PendingDispatch::Streaming { req, .. }
                        | PendingDispatch::Drain { req, .. }
                        | PendingDispatch::AwaitReply { req, .. } => req,
                    };
                    let mut arena = req.into_arena();
                    arena.reset();
                    conn.arena = Some(arena);
                }
            }
            close_client(server, &timer_conn);
        }),
    );
    conn_rc.borrow_mut().request_timer = Some(timer);
    true
}
