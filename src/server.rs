// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Server lifecycle: init, listen, run, graceful shutdown.
//!
//! The shutdown state machine goes RUNNING → SHUTDOWN_REQUESTED →
//! DRAINING → CLOSED. A request (signal, explicit call, or the async
//! counter draining to zero) stops accepting, stops the sweeper and
//! runs the user's at-exit callback; the heavy drain (waiting out
//! pending worker jobs and in-flight requests, then force-closing) only
//! ever runs outside the dispatch loop. Running it from inside an I/O
//! callback would tear down a connection the reactor still holds
//! borrows of, which is why `run` finishes the loop first and drains
//! afterwards.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;

use crate::arena::ArenaPool;
use crate::connection::{
    arm_request_timer, close_client, handle_http_completion, install_takeover, on_readable,
    on_writable, Connection, DoneFn, TakenConnection,
};
use crate::date::{DateCache, DATE_REFRESH_INTERVAL_MS};
use crate::middleware::{Handler, Middleware, RouteEntry};
use crate::reactor::{
    Completion, TaskPool, Timer, TimerCb, TimerQueue, LISTENER_TOKEN, MAX_CONN_TOKEN,
    SIGNALS_TOKEN, WAKER_TOKEN,
};
use crate::request::Req;
use crate::response::Res;
use crate::router::{Method, RouteTrie};
use crate::{
    CLEANUP_INTERVAL_MS, IDLE_TIMEOUT_MS, LISTEN_BACKLOG, MAX_CONNECTIONS, SHUTDOWN_TIMEOUT_MS,
};

#[cfg(unix)]
use signal_hook::consts::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook_mio::v1_0::Signals;

/// Why `Server::new`, `listen` or `run` refused. The numeric codes are
/// stable and negative, for embedders that exit with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerError {
    AlreadyInitialized,
    NotInitialized,
    AlreadyRunning,
    InitFailed,
    OutOfMemory,
    BindFailed,
    ListenFailed,
    InvalidPort,
}

impl ServerError {
    pub fn code(&self) -> i32 {
        match self {
            ServerError::AlreadyInitialized => -1,
            ServerError::NotInitialized => -2,
            ServerError::AlreadyRunning => -3,
            ServerError::InitFailed => -4,
            ServerError::OutOfMemory => -5,
            ServerError::BindFailed => -6,
            ServerError::ListenFailed => -7,
            ServerError::InvalidPort => -8,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ServerError::AlreadyInitialized => "server already initialized",
            ServerError::NotInitialized => "server not initialized",
            ServerError::AlreadyRunning => "server already running",
            ServerError::InitFailed => "server initialization failed",
            ServerError::OutOfMemory => "out of memory",
            ServerError::BindFailed => "failed to bind listening socket",
            ServerError::ListenFailed => "failed to listen",
            ServerError::InvalidPort => "invalid port",
        };
        f.write_str(text)
    }
}

impl std::error::Error for ServerError {}

/// Everything the reactor thread owns, shared by handles.
pub struct ServerInner {
    pub(crate) running: Cell<bool>,
    listening: Cell<bool>,
    pub(crate) shutdown_requested: Cell<bool>,
    /// True while `run`'s poll loop is executing; shutdown defers its
    /// drain phase when set.
    dispatching: Cell<bool>,
    cleanup_done: Cell<bool>,

    poll: RefCell<Poll>,
    pub(crate) registry: Registry,
    waker: Arc<Waker>,
    external_shutdown: Arc<AtomicBool>,

    listener: RefCell<Option<TcpListener>>,
    listen_port: Cell<u16>,

    conns: RefCell<Slab<Rc<RefCell<Connection>>>>,
    active_connections: Cell<usize>,
    next_client_id: AtomicU64,

    trie: RwLock<RouteTrie>,
    globals: RefCell<Rc<[Middleware]>>,

    pub(crate) timers: RefCell<TimerQueue>,
    sweeper: Cell<Option<Timer>>,
    date_timer: Cell<Option<Timer>>,

    pub(crate) pool: RefCell<ArenaPool>,
    pub(crate) date: DateCache,

    tasks: TaskPool,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    pending_async: AtomicUsize,
    jobs: RefCell<HashMap<u64, Box<dyn FnOnce(Box<dyn std::any::Any + Send>)>>>,
    next_job_id: Cell<u64>,

    atexit_cb: RefCell<Option<Box<dyn FnOnce()>>>,

    #[cfg(unix)]
    signals: RefCell<Option<Signals>>,

    worker_mode: bool,
    test_mode: bool,
}

impl ServerInner {
    pub(crate) fn connection(&self, token: usize) -> Option<Rc<RefCell<Connection>>> {
        self.conns.borrow().get(token).cloned()
    }

    pub(crate) fn remove_connection(&self, token: usize) {
        if self.conns.borrow_mut().try_remove(token).is_some() {
            let active = self.active_connections.get();
            self.active_connections.set(active.saturating_sub(1));
        }
    }

    pub(crate) fn read_routes(&self) -> RwLockReadGuard<'_, RouteTrie> {
        self.trie.read().unwrap_or_else(|poison| poison.into_inner())
    }

    fn write_routes(&self) -> RwLockWriteGuard<'_, RouteTrie> {
        self.trie.write().unwrap_or_else(|poison| poison.into_inner())
    }

    pub(crate) fn global_middleware(&self) -> Rc<[Middleware]> {
        self.globals.borrow().clone()
    }

    fn schedule(&self, delay_ms: u64, period_ms: Option<u64>, cb: TimerCb) -> Timer {
        self.timers.borrow_mut().schedule(
            Duration::from_millis(delay_ms),
            period_ms.map(Duration::from_millis),
            cb,
        )
    }
}

/// A listening HTTP server bound to one reactor thread.
pub struct Server {
    inner: Rc<ServerInner>,
}

impl Server {
    /// Creates the reactor loop, arena pool, date cache, worker pool,
    /// shutdown wakeup and (outside cluster-worker mode) the
    /// SIGINT/SIGTERM handlers.
    pub fn new() -> Result<Server, ServerError> {
        let poll = Poll::new().map_err(|e| {
            log::error!("failed to create poll: {e}");
            ServerError::InitFailed
        })?;
        let registry = poll.registry().try_clone().map_err(|e| {
            log::error!("failed to clone registry: {e}");
            ServerError::InitFailed
        })?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(|e| {
            log::error!("failed to create waker: {e}");
            ServerError::InitFailed
        })?;

        let worker_mode = std::env::var("ECEWO_WORKER").map_or(false, |v| v == "1");
        let test_mode = std::env::var("ECEWO_TEST_MODE").map_or(false, |v| v == "1");

        #[cfg(unix)]
        let signals = if worker_mode {
            None
        } else {
            let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| {
                log::error!("failed to install signal handlers: {e}");
                ServerError::InitFailed
            })?;
            poll.registry()
                .register(&mut signals, SIGNALS_TOKEN, Interest::READABLE)
                .map_err(|e| {
                    log::error!("failed to register signal source: {e}");
                    ServerError::InitFailed
                })?;
            Some(signals)
        };

        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();

        let inner = Rc::new(ServerInner {
            running: Cell::new(false),
            listening: Cell::new(false),
            shutdown_requested: Cell::new(false),
            dispatching: Cell::new(false),
            cleanup_done: Cell::new(false),
            poll: RefCell::new(poll),
            registry,
            waker: Arc::new(waker),
            external_shutdown: Arc::new(AtomicBool::new(false)),
            listener: RefCell::new(None),
            listen_port: Cell::new(0),
            conns: RefCell::new(Slab::new()),
            active_connections: Cell::new(0),
            next_client_id: AtomicU64::new(1),
            trie: RwLock::new(RouteTrie::new()),
            globals: RefCell::new(Rc::from([])),
            timers: RefCell::new(TimerQueue::new()),
            sweeper: Cell::new(None),
            date_timer: Cell::new(None),
            pool: RefCell::new(ArenaPool::new()),
            date: DateCache::new(),
            tasks: TaskPool::new(),
            completions_tx,
            completions_rx,
            pending_async: AtomicUsize::new(0),
            jobs: RefCell::new(HashMap::new()),
            next_job_id: Cell::new(1),
            atexit_cb: RefCell::new(None),
            #[cfg(unix)]
            signals: RefCell::new(signals),
            worker_mode,
            test_mode,
        });

        Ok(Server { inner })
    }

    /// Registers a route. `:name` path segments capture one segment
    /// each, a trailing `*` matches any remainder.
    pub fn route<F>(&self, method: Method, path: &str, middleware: Vec<Middleware>, handler: F)
    where
        F: Fn(&mut Req, &mut Res) + 'static,
    {
        let entry = RouteEntry {
            handler: Rc::new(handler) as Handler,
            middleware: middleware.into(),
        };
        self.inner.write_routes().add(method, path, entry);
    }

    pub fn get<F: Fn(&mut Req, &mut Res) + 'static>(&self, path: &str, handler: F) {
        self.route(Method::Get, path, Vec::new(), handler);
    }

    pub fn post<F: Fn(&mut Req, &mut Res) + 'static>(&self, path: &str, handler: F) {
        self.route(Method::Post, path, Vec::new(), handler);
    }

    pub fn put<F: Fn(&mut Req, &mut Res) + 'static>(&self, path: &str, handler: F) {
        self.route(Method::Put, path, Vec::new(), handler);
    }

    pub fn patch<F: Fn(&mut Req, &mut Res) + 'static>(&self, path: &str, handler: F) {
        self.route(Method::Patch, path, Vec::new(), handler);
    }

    pub fn delete<F: Fn(&mut Req, &mut Res) + 'static>(&self, path: &str, handler: F) {
        self.route(Method::Delete, path, Vec::new(), handler);
    }

    pub fn head<F: Fn(&mut Req, &mut Res) + 'static>(&self, path: &str, handler: F) {
        self.route(Method::Head, path, Vec::new(), handler);
    }

    pub fn options<F: Fn(&mut Req, &mut Res) + 'static>(&self, path: &str, handler: F) {
        self.route(Method::Options, path, Vec::new(), handler);
    }

    /// Installs process-wide middleware, run before every route-local
    /// chain in installation order.
    pub fn use_middleware(&self, mw: Middleware) {
        let mut globals = self.inner.globals.borrow_mut();
        let mut list: Vec<Middleware> = globals.iter().cloned().collect();
        list.push(mw);
        *globals = list.into();
    }

    /// Opens the listening socket on `0.0.0.0:port` and starts the
    /// idle-connection sweeper and the date cache refresh.
    pub fn listen(&self, port: u16) -> Result<(), ServerError> {
        if port == 0 {
            log::error!("invalid port 0 (must be 1-65535)");
            return Err(ServerError::InvalidPort);
        }
        if self.inner.running.get() {
            return Err(ServerError::AlreadyRunning);
        }
        if self.inner.listening.get() {
            return Err(ServerError::AlreadyInitialized);
        }

        let listener = bind_listener(port, self.inner.test_mode)?;
        let mut listener = TcpListener::from_std(listener);
        self.inner
            .registry
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|e| {
                log::error!("failed to register listener: {e}");
                ServerError::InitFailed
            })?;

        *self.inner.listener.borrow_mut() = Some(listener);
        self.inner.listen_port.set(port);
        self.inner.listening.set(true);

        let sweeper = self.inner.schedule(
            CLEANUP_INTERVAL_MS,
            Some(CLEANUP_INTERVAL_MS),
            Rc::new(sweep_idle_connections),
        );
        self.inner.sweeper.set(Some(sweeper));

        let date_timer = self.inner.schedule(
            DATE_REFRESH_INTERVAL_MS,
            Some(DATE_REFRESH_INTERVAL_MS),
            Rc::new(|inner: &Rc<ServerInner>| inner.date.refresh()),
        );
        self.inner.date_timer.set(Some(date_timer));

        if !self.inner.worker_mode {
            println!("Server listening on http://localhost:{port}");
        }
        Ok(())
    }

    /// Enters the reactor loop. Returns after a graceful shutdown has
    /// drained the loop.
    pub fn run(&self) {
        if !self.inner.listening.get() {
            log::error!("server not initialized or not listening");
            return;
        }
        if self.inner.running.replace(true) {
            log::error!("server already running");
            return;
        }

        self.inner.dispatching.set(true);
        let mut events = Events::with_capacity(1024);

        while !self.inner.shutdown_requested.get() {
            if self.inner.external_shutdown.load(Ordering::Acquire) {
                request_shutdown(&self.inner);
                break;
            }

            let timeout = next_poll_timeout(&self.inner);
            poll_once(&self.inner, &mut events, timeout);
        }

        self.inner.dispatching.set(false);
        request_shutdown(&self.inner);
        shutdown_cleanup(&self.inner);
        self.inner.running.set(false);
    }

    /// Requests a graceful shutdown. Callable from handlers and timers;
    /// the drain runs once the loop has unwound.
    pub fn shutdown(&self) {
        request_shutdown(&self.inner);
    }

    /// A thread-safe handle that can request shutdown from outside the
    /// reactor thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.inner.external_shutdown.clone(),
            waker: self.inner.waker.clone(),
        }
    }

    /// A clonable reactor-thread handle for timers and worker jobs.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: self.inner.clone(),
        }
    }

    /// Registers a callback to run once, when shutdown is requested.
    pub fn at_exit<F: FnOnce() + 'static>(&self, callback: F) {
        *self.inner.atexit_cb.borrow_mut() = Some(Box::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active_connections.get()
    }

    pub fn pending_async_work(&self) -> usize {
        self.inner.pending_async.load(Ordering::Acquire)
    }

    /// Address of the listening socket, once `listen` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .borrow()
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    /// One-shot timer on the reactor thread.
    pub fn set_timeout<F: FnOnce() + 'static>(&self, delay_ms: u64, callback: F) -> Timer {
        self.handle().set_timeout(delay_ms, callback)
    }

    /// Repeating timer on the reactor thread.
    pub fn set_interval<F: FnMut() + 'static>(&self, interval_ms: u64, callback: F) -> Timer {
        self.handle().set_interval(interval_ms, callback)
    }

    /// Stops a timer created with `set_timeout`/`set_interval`.
    pub fn clear_timer(&self, timer: Timer) {
        self.handle().clear_timer(timer);
    }

    /// Runs `work` on the worker pool, then `done` back on the reactor
    /// thread with the work's output.
    pub fn spawn<T, W, D>(&self, work: W, done: D)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        D: FnOnce(T) + 'static,
    {
        self.handle().spawn(work, done);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        request_shutdown(&self.inner);
        if !self.inner.dispatching.get() {
            shutdown_cleanup(&self.inner);
        }
    }
}

/// Requests shutdown from any thread; pairs with [`Server::run`] on the
/// reactor thread noticing the flag.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            log::error!("failed to wake reactor for shutdown: {e}");
        }
    }
}

/// Reactor-thread handle to timers, worker jobs and shutdown. Not
/// `Send`: it must stay on the thread that runs the server.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Rc<ServerInner>,
}

impl LoopHandle {
    pub fn set_timeout<F: FnOnce() + 'static>(&self, delay_ms: u64, callback: F) -> Timer {
        let slot = RefCell::new(Some(callback));
        self.inner.schedule(
            delay_ms,
            None,
            Rc::new(move |_inner: &Rc<ServerInner>| {
                if let Some(cb) = slot.borrow_mut().take() {
                    cb();
                }
            }),
        )
    }

    pub fn set_interval<F: FnMut() + 'static>(&self, interval_ms: u64, callback: F) -> Timer {
        let slot = RefCell::new(callback);
        self.inner.schedule(
            interval_ms,
            Some(interval_ms),
            Rc::new(move |_inner: &Rc<ServerInner>| {
                (&mut *slot.borrow_mut())();
            }),
        )
    }

    pub fn clear_timer(&self, timer: Timer) {
        self.inner.timers.borrow_mut().cancel(timer);
    }

    pub fn shutdown(&self) {
        request_shutdown(&self.inner);
    }

    pub fn pending_async_work(&self) -> usize {
        self.inner.pending_async.load(Ordering::Acquire)
    }

    pub fn spawn<T, W, D>(&self, work: W, done: D)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        D: FnOnce(T) + 'static,
    {
        let job_id = self.inner.next_job_id.get();
        self.inner.next_job_id.set(job_id + 1);

        self.inner.jobs.borrow_mut().insert(
            job_id,
            Box::new(move |payload| match payload.downcast::<T>() {
                Ok(out) => done(*out),
                Err(_) => log::error!("worker payload type mismatch, done-callback skipped"),
            }),
        );

        self.inner.pending_async.fetch_add(1, Ordering::AcqRel);

        let tx = self.inner.completions_tx.clone();
        let waker = self.inner.waker.clone();
        self.inner.tasks.spawn(move || {
            let out = work();
            let _ = tx.send(Completion::Job {
                job_id,
                payload: Box::new(out),
            });
            let _ = waker.wake();
        });
    }
}

/// Runs blocking `work` off-loop while keeping the response's
/// connection alive, then `done(req, res, output)` back on the reactor
/// thread. The done-callback is skipped if the connection has become
/// invalid or closing in the meantime.
pub fn spawn_http<T, W, D>(res: &Res, work: W, done: D)
where
    T: Send + 'static,
    W: FnOnce() -> T + Send + 'static,
    D: FnOnce(&mut Req, &mut Res, T) + 'static,
{
    let Some(client) = res.client() else {
        log::error!("spawn_http: response is not attached to a connection");
        return;
    };

    let server = client.server.clone();
    let (token, conn_id) = {
        let conn = client.conn.borrow();
        (conn.token, conn.id)
    };

    let done: DoneFn = Box::new(move |req, res, payload| match payload.downcast::<T>() {
        Ok(out) => done(req, res, *out),
        Err(_) => log::error!("worker payload type mismatch, done-callback skipped"),
    });
    client.conn.borrow_mut().done_queue.push_back(done);

    server.pending_async.fetch_add(1, Ordering::AcqRel);

    let tx = server.completions_tx.clone();
    let waker = server.waker.clone();
    server.tasks.spawn(move || {
        let out = work();
        let _ = tx.send(Completion::Http {
            token,
            conn_id,
            payload: Box::new(out),
        });
        let _ = waker.wake();
    });
}

/// Arms (or re-arms) this request's timeout. When it fires the arena is
/// reset and the connection closed.
pub fn request_timeout(res: &Res, timeout_ms: u64) -> bool {
    let Some(client) = res.client() else {
        return false;
    };
    arm_request_timer(&client.server, &client.conn, timeout_ms)
}

/// Configuration for [`connection_takeover`].
#[derive(Default)]
pub struct TakeoverConfig {
    /// Called on the reactor thread for every read delivery after the
    /// takeover. Without one, inbound bytes are discarded.
    pub on_data: Option<Box<dyn FnMut(&TakenConnection, &[u8])>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeoverError {
    /// The response is not attached to a live connection.
    InvalidClient,
    /// The connection has already been handed to another owner.
    AlreadyTakenOver,
}

impl fmt::Display for TakeoverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TakeoverError::InvalidClient => f.write_str("no live connection to take over"),
            TakeoverError::AlreadyTakenOver => f.write_str("connection already taken over"),
        }
    }
}

impl std::error::Error for TakeoverError {}

/// Detaches the connection from HTTP handling and routes its socket
/// reads to `config.on_data` (the WebSocket-upgrade hook). The HTTP
/// core stops touching the socket; the returned handle writes to it.
///
/// The current response is marked replied without putting anything on
/// the wire: the new protocol owner speaks first (e.g. the `101
/// Switching Protocols` head) through the handle.
pub fn connection_takeover(
    res: &mut Res,
    config: TakeoverConfig,
) -> Result<TakenConnection, TakeoverError> {
    let client = match res.client() {
        Some(client) => client.clone(),
        None => {
            log::error!("connection_takeover: invalid arguments");
            return Err(TakeoverError::InvalidClient);
        }
    };

    {
        let conn = client.conn.borrow();
        if !conn.valid || conn.closing {
            return Err(TakeoverError::InvalidClient);
        }
        if conn.taken_over {
            log::error!("connection_takeover: already taken over");
            return Err(TakeoverError::AlreadyTakenOver);
        }
    }

    install_takeover(&client.conn, config.on_data);
    res.mark_replied();

    Ok(TakenConnection { client })
}

// ---- reactor internals ----

fn bind_listener(port: u16, test_mode: bool) -> Result<std::net::TcpListener, ServerError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(|e| {
        log::error!("failed to create socket: {e}");
        ServerError::InitFailed
    })?;

    socket.set_reuse_address(true).map_err(|e| {
        log::error!("failed to set SO_REUSEADDR: {e}");
        ServerError::InitFailed
    })?;

    // SO_REUSEPORT lets cluster workers share one port; tests disable it
    // so a second bind fails loudly instead of splitting traffic.
    #[cfg(all(unix, not(target_os = "macos")))]
    if !test_mode {
        if let Err(e) = socket.set_reuse_port(true) {
            log::debug!("failed to set SO_REUSEPORT: {e}");
        }
    }
    #[cfg(not(all(unix, not(target_os = "macos"))))]
    let _ = test_mode;

    socket.set_nonblocking(true).map_err(|e| {
        log::error!("failed to set nonblocking: {e}");
        ServerError::InitFailed
    })?;

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket.bind(&addr.into()).map_err(|e| {
        log::error!("failed to bind port {port} (may be in use): {e}");
        ServerError::BindFailed
    })?;

    socket.listen(LISTEN_BACKLOG as i32).map_err(|e| {
        log::error!("failed to listen on port {port}: {e}");
        ServerError::ListenFailed
    })?;

    Ok(socket.into())
}

fn next_poll_timeout(inner: &Rc<ServerInner>) -> Option<Duration> {
    inner
        .timers
        .borrow_mut()
        .next_deadline()
        .map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

/// One reactor turn: poll, dispatch events, drain worker completions,
/// fire due timers. Used by both the main loop and the shutdown drain.
fn poll_once(inner: &Rc<ServerInner>, events: &mut Events, timeout: Option<Duration>) {
    {
        let mut poll = inner.poll.borrow_mut();
        if let Err(e) = poll.poll(events, timeout) {
            if e.kind() != ErrorKind::Interrupted {
                log::error!("poll failed: {e}");
            }
        }
    }

    for event in events.iter() {
        match event.token() {
            LISTENER_TOKEN => accept_connections(inner),
            WAKER_TOKEN => {
                // Completions and the external shutdown flag are checked
                // after the event sweep / by the loop condition.
            }
            SIGNALS_TOKEN => handle_signals(inner),
            Token(token) if token <= MAX_CONN_TOKEN => {
                if event.is_readable() {
                    on_readable(inner, token);
                }
                if event.is_writable() {
                    on_writable(inner, token);
                }
            }
            _ => {}
        }
    }

    drain_completions(inner);

    let due = inner.timers.borrow_mut().pop_due(Instant::now());
    for callback in due {
        callback(inner);
    }
}

fn accept_connections(inner: &Rc<ServerInner>) {
    loop {
        let accepted = {
            let listener = inner.listener.borrow();
            let Some(listener) = listener.as_ref() else {
                return;
            };
            listener.accept()
        };

        match accepted {
            Ok((stream, _addr)) => {
                if inner.shutdown_requested.get() {
                    continue;
                }
                if inner.active_connections.get() >= MAX_CONNECTIONS {
                    log::debug!("max connections ({MAX_CONNECTIONS}) reached");
                    continue;
                }
                register_connection(inner, stream);
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("accept error: {e}");
                return;
            }
        }
    }
}

fn register_connection(inner: &Rc<ServerInner>, mut stream: TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("failed to set TCP_NODELAY: {e}");
    }

    let id = inner.next_client_id.fetch_add(1, Ordering::Relaxed);
    let arena = inner.pool.borrow_mut().borrow();

    let mut conns = inner.conns.borrow_mut();
    let entry = conns.vacant_entry();
    let token = entry.key();
    if token > MAX_CONN_TOKEN {
        log::error!("connection table exhausted");
        inner.pool.borrow_mut().give_back(arena);
        return;
    }

    if let Err(e) = inner
        .registry
        .register(&mut stream, Token(token), Interest::READABLE)
    {
        log::error!("failed to register connection: {e}");
        drop(conns);
        inner.pool.borrow_mut().give_back(arena);
        return;
    }

    let conn = Connection::new(id, token, stream, arena);
    entry.insert(Rc::new(RefCell::new(conn)));
    inner
        .active_connections
        .set(inner.active_connections.get() + 1);
}

#[cfg(unix)]
fn handle_signals(inner: &Rc<ServerInner>) {
    let pending: Vec<i32> = {
        let mut signals = inner.signals.borrow_mut();
        match signals.as_mut() {
            Some(signals) => signals.pending().collect(),
            None => return,
        }
    };

    for signal in pending {
        log::debug!("received signal {signal}, shutting down");
        request_shutdown(inner);
    }
}

#[cfg(not(unix))]
fn handle_signals(_inner: &Rc<ServerInner>) {}

fn drain_completions(inner: &Rc<ServerInner>) {
    while let Ok(completion) = inner.completions_rx.try_recv() {
        match completion {
            Completion::Job { job_id, payload } => {
                let done = inner.jobs.borrow_mut().remove(&job_id);
                if let Some(done) = done {
                    done(payload);
                }
            }
            Completion::Http {
                token,
                conn_id,
                payload,
            } => {
                handle_http_completion(inner, token, conn_id, payload);
            }
        }
        decrement_async_work(inner);
    }
}

fn decrement_async_work(inner: &Rc<ServerInner>) {
    let prev = inner.pending_async.fetch_sub(1, Ordering::AcqRel);
    if prev == 0 {
        log::error!("async work counter underflow");
        inner.pending_async.store(0, Ordering::Release);
    }
}

fn sweep_idle_connections(inner: &Rc<ServerInner>) {
    if inner.shutdown_requested.get() {
        return;
    }

    let idle_cutoff = Duration::from_millis(IDLE_TIMEOUT_MS);
    let now = Instant::now();

    let candidates: Vec<_> = inner
        .conns
        .borrow()
        .iter()
        .map(|(_, rc)| rc.clone())
        .collect();
    for conn_rc in candidates {
        let stale = {
            let conn = conn_rc.borrow();
            conn.keep_alive_enabled
                && !conn.closing
                && !conn.taken_over
                && now.duration_since(conn.last_activity) > idle_cutoff
        };
        if stale {
            close_client(inner, &conn_rc);
        }
    }
}

/// The light half of shutdown: flags, listener, sweeper, signals,
/// at-exit callback. Safe to call from inside the dispatch loop.
pub(crate) fn request_shutdown(inner: &Rc<ServerInner>) {
    if inner.shutdown_requested.replace(true) {
        return;
    }

    if let Some(callback) = inner.atexit_cb.borrow_mut().take() {
        callback();
    }

    if let Some(sweeper) = inner.sweeper.take() {
        inner.timers.borrow_mut().cancel(sweeper);
    }

    #[cfg(unix)]
    {
        let mut signals = inner.signals.borrow_mut();
        if let Some(mut signals) = signals.take() {
            let _ = inner.registry.deregister(&mut signals);
        }
    }

    // Stop accepting new connections.
    if let Some(mut listener) = inner.listener.borrow_mut().take() {
        let _ = inner.registry.deregister(&mut listener);
    }
    inner.listening.set(false);

    // Inside the dispatch loop the drain is deferred: tearing down
    // connections mid-callback would invalidate live borrows. `run`
    // notices the flag, unwinds, and drains.
    if inner.dispatching.get() {
        return;
    }
    shutdown_cleanup(inner);
}

/// The heavy half: drain pending worker jobs, wait for in-flight
/// requests, then force-close whatever is left. Only runs outside the
/// dispatch loop.
pub(crate) fn shutdown_cleanup(inner: &Rc<ServerInner>) {
    if inner.cleanup_done.replace(true) {
        return;
    }

    let budget = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
    let tick = Some(Duration::from_millis(50));
    let mut events = Events::with_capacity(256);

    // Wait out external async work.
    let start = Instant::now();
    while inner.pending_async.load(Ordering::Acquire) > 0 {
        if start.elapsed() >= budget {
            log::debug!(
                "shutdown timeout: {} async operation(s) abandoned",
                inner.pending_async.load(Ordering::Acquire)
            );
            break;
        }
        poll_once(inner, &mut events, tick);
    }

    // Close idle connections, wait for active requests to finish.
    let start = Instant::now();
    loop {
        let candidates: Vec<_> = inner
            .conns
            .borrow()
            .iter()
            .map(|(_, rc)| rc.clone())
            .collect();
        for conn_rc in candidates {
            let busy = {
                let conn = conn_rc.borrow();
                conn.request_in_progress && !conn.closing
            };
            if !busy {
                close_client(inner, &conn_rc);
            }
        }

        if inner.conns.borrow().is_empty() {
            break;
        }
        if start.elapsed() >= budget {
            log::debug!(
                "graceful shutdown timeout: {} connection(s) forced closed",
                inner.conns.borrow().len()
            );
            break;
        }
        // Requests still in flight, or closers waiting on their final
        // flush; give the loop a turn.
        poll_once(inner, &mut events, tick);
    }

    // Force-close everything that remains.
    let leftovers: Vec<_> = inner
        .conns
        .borrow()
        .iter()
        .map(|(_, rc)| rc.clone())
        .collect();
    for conn_rc in leftovers {
        close_client(inner, &conn_rc);
    }

    // Give queued responses a short final flush window.
    let start = Instant::now();
    while !inner.conns.borrow().is_empty() && start.elapsed() < Duration::from_millis(500) {
        poll_once(inner, &mut events, Some(Duration::from_millis(20)));
    }
    inner.conns.borrow_mut().clear();

    // Drop timers and parked jobs; they hold cycles back into server
    // state.
    inner.timers.borrow_mut().clear();
    inner.jobs.borrow_mut().clear();
    inner.sweeper.set(None);
    inner.date_timer.set(None);
}
