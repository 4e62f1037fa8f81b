// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The middleware chain.
//!
//! A route carries an ordered list of middleware terminated by its
//! handler. Every middleware receives `(req, res, next)`; calling
//! [`Next::run`] advances the chain, not calling it short-circuits.
//! Process-wide middleware installed with `Server::use_middleware` runs
//! before the route-local list.
//!
//! `Next` is a by-value cursor: a middleware that wants to finish
//! asynchronously captures it (and nothing else; `req`/`res` are handed
//! back by the worker bridge) and calls it from a `spawn_http`
//! done-callback. Because `run` consumes the cursor, every chain
//! position executes at most once.

use std::rc::Rc;

use crate::request::Req;
use crate::response::Res;

/// A request handler. Runs on the reactor thread only.
pub type Handler = Rc<dyn Fn(&mut Req, &mut Res)>;

/// One entry of a middleware list.
#[derive(Clone)]
pub enum Middleware {
    /// An ordinary `(req, res, next)` interceptor.
    Func(Rc<dyn Fn(&mut Req, &mut Res, Next)>),
    /// The body-streaming switch. Kept as its own variant so the
    /// dispatcher can recognize it in global/route lists before any body
    /// byte is parsed.
    BodyStream,
}

/// Wraps a closure as a [`Middleware`].
pub fn middleware<F>(f: F) -> Middleware
where
    F: Fn(&mut Req, &mut Res, Next) + 'static,
{
    Middleware::Func(Rc::new(f))
}

/// The body-streaming middleware. See [`crate::body`].
pub fn body_stream() -> Middleware {
    Middleware::BodyStream
}

/// A handler plus its route-local middleware, as stored in the trie.
#[derive(Clone)]
pub struct RouteEntry {
    pub handler: Handler,
    pub middleware: Rc<[Middleware]>,
}

/// The fully assembled chain for one request: global middleware, then
/// route middleware, then the handler.
pub struct ChainInfo {
    globals: Rc<[Middleware]>,
    locals: Rc<[Middleware]>,
    handler: Handler,
}

impl ChainInfo {
    pub fn new(globals: Rc<[Middleware]>, locals: Rc<[Middleware]>, handler: Handler) -> ChainInfo {
        ChainInfo {
            globals,
            locals,
            handler,
        }
    }

    fn len(&self) -> usize {
        self.globals.len() + self.locals.len()
    }

    fn get(&self, index: usize) -> Option<&Middleware> {
        if index < self.globals.len() {
            self.globals.get(index)
        } else {
            self.locals.get(index - self.globals.len())
        }
    }

    /// True if `body_stream` appears anywhere in the chain.
    pub fn has_body_stream(&self) -> bool {
        self.globals
            .iter()
            .chain(self.locals.iter())
            .any(|mw| matches!(mw, Middleware::BodyStream))
    }
}

/// Continuation cursor handed to each middleware.
pub struct Next {
    chain: Rc<ChainInfo>,
    index: usize,
}

impl Next {
    /// Advances to the next middleware, or to the handler once the list
    /// is exhausted. A reply sent upstream stops the chain.
    pub fn run(self, req: &mut Req, res: &mut Res) {
        if res.replied() {
            return;
        }

        let Next { chain, index } = self;
        match chain.get(index) {
            Some(Middleware::Func(func)) => {
                let func = func.clone();
                let next = Next {
                    chain,
                    index: index + 1,
                };
                func(req, res, next);
            }
            Some(Middleware::BodyStream) => {
                let next = Next {
                    chain,
                    index: index + 1,
                };
                crate::body::run_body_stream(req, res, next);
            }
            None => {
                debug_assert_eq!(index, chain.len());
                (chain.handler)(req, res);
            }
        }
    }
}

/// Runs a chain from its first element.
pub fn chain_start(chain: Rc<ChainInfo>, req: &mut Req, res: &mut Res) {
    Next { chain, index: 0 }.run(req, res);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn noop_handler() -> Handler {
        Rc::new(|_req: &mut Req, _res: &mut Res| {})
    }

    fn record(trace: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> Middleware {
        let trace = trace.clone();
        middleware(move |req, res, next| {
            trace.borrow_mut().push(tag);
            next.run(req, res);
        })
    }

    #[test]
    fn declared_order_globals_first() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let handler_trace = trace.clone();

        let globals: Rc<[Middleware]> = vec![record(&trace, "g1"), record(&trace, "g2")].into();
        let locals: Rc<[Middleware]> = vec![record(&trace, "r1")].into();
        let handler: Handler = Rc::new(move |_req, _res| {
            handler_trace.borrow_mut().push("handler");
        });

        let chain = Rc::new(ChainInfo::new(globals, locals, handler));
        let (mut req, mut res) = crate::test_support::req_res();
        chain_start(chain, &mut req, &mut res);

        assert_eq!(*trace.borrow(), ["g1", "g2", "r1", "handler"]);
    }

    #[test]
    fn skipping_next_short_circuits() {
        let trace = Rc::new(RefCell::new(Vec::new()));
        let handler_trace = trace.clone();

        let stopper = middleware(|_req, _res, _next| {
            // Deliberately drops `next`.
        });
        let globals: Rc<[Middleware]> = vec![stopper].into();
        let handler: Handler = Rc::new(move |_req, _res| {
            handler_trace.borrow_mut().push("handler");
        });

        let chain = Rc::new(ChainInfo::new(globals, Rc::from([]), handler));
        let (mut req, mut res) = crate::test_support::req_res();
        chain_start(chain, &mut req, &mut res);

        assert!(trace.borrow().is_empty());
    }

    #[test]
    fn detects_body_stream_in_either_list() {
        let chain = ChainInfo::new(Rc::from([body_stream()]), Rc::from([]), noop_handler());
        assert!(chain.has_body_stream());

        let chain = ChainInfo::new(Rc::from([]), Rc::from([body_stream()]), noop_handler());
        assert!(chain.has_body_stream());

        let chain = ChainInfo::new(Rc::from([]), Rc::from([]), noop_handler());
        assert!(!chain.has_body_stream());
    }
}
