// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Reactor plumbing shared by the server loop.
//!
//! One thread owns all I/O: the mio poll, every connection, every timer
//! callback and every handler call. The only things that cross thread
//! boundaries are worker jobs (out) and their completion tokens (back,
//! over a FIFO channel paired with a [`mio::Waker`]), which preserves
//! per-connection completion order.

use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::Token;

pub use self::task_pool::TaskPool;

mod task_pool;

/// Token of the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);
/// Token of the cross-thread waker.
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);
/// Token of the signal event source.
pub const SIGNALS_TOKEN: Token = Token(usize::MAX - 2);
/// Largest token usable for connections.
pub const MAX_CONN_TOKEN: usize = usize::MAX - 3;

/// A finished worker job, delivered back to the reactor thread.
pub enum Completion {
    /// A `spawn` job: the done-callback waits in the server's job table.
    Job {
        job_id: u64,
        payload: Box<dyn Any + Send>,
    },
    /// A `spawn_http` job: the done-callback waits on the connection.
    /// `conn_id` guards against slab-token reuse.
    Http {
        token: usize,
        conn_id: u64,
        payload: Box<dyn Any + Send>,
    },
}

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer(pub(crate) u64);

/// Timer callbacks run on the reactor thread and receive the server so
/// internal timers (sweeper, date refresh, request timeouts) can reach
/// connection state. User-facing wrappers ignore the argument.
pub type TimerCb = Rc<dyn Fn(&Rc<crate::server::ServerInner>)>;

struct TimerEntry {
    callback: TimerCb,
    deadline: Instant,
    period: Option<Duration>,
}

/// One-shot and interval timers, driven by the poll timeout.
///
/// The heap may hold stale deadlines for cancelled or rescheduled
/// timers; entries are authoritative and stale pops are skipped.
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, TimerEntry>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    /// Schedules `callback` after `delay`, repeating every `period` if
    /// one is given.
    pub fn schedule(
        &mut self,
        delay: Duration,
        period: Option<Duration>,
        callback: TimerCb,
    ) -> Timer {
        let id = self.next_id;
        self.next_id += 1;

        let deadline = Instant::now() + delay;
        self.entries.insert(
            id,
            TimerEntry {
                callback,
                deadline,
                period,
            },
        );
        self.heap.push(Reverse((deadline, id)));
        Timer(id)
    }

    /// Stops a timer. Safe to call on an already-fired one-shot.
    pub fn cancel(&mut self, timer: Timer) -> bool {
        self.entries.remove(&timer.0).is_some()
    }

    /// Moves a pending timer to `delay` from now. Used by the
    /// re-armable per-request timeout.
    pub fn reschedule(&mut self, timer: Timer, delay: Duration) -> bool {
        let Some(entry) = self.entries.get_mut(&timer.0) else {
            return false;
        };
        entry.deadline = Instant::now() + delay;
        self.heap.push(Reverse((entry.deadline, timer.0)));
        true
    }

    /// Deadline of the nearest live timer, for the poll timeout.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            match self.entries.get(&id) {
                Some(entry) if entry.deadline == deadline => return Some(deadline),
                // Stale heap entry: cancelled, fired, or rescheduled.
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Removes and returns every timer due at `now`, rescheduling
    /// intervals. Callbacks are returned rather than invoked so the
    /// caller can drop its borrow of the queue first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerCb> {
        let mut due = Vec::new();

        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();

            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if entry.deadline != deadline {
                continue;
            }

            due.push(entry.callback.clone());
            match entry.period {
                Some(period) => {
                    entry.deadline = now + period;
                    self.heap.push(Reverse((entry.deadline, id)));
                }
                None => {
                    self.entries.remove(&id);
                }
            }
        }

        due
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops every timer. Used at shutdown to break callback cycles.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.heap.clear();
    }
}

impl Default for TimerQueue {
    fn default() -> TimerQueue {
        TimerQueue::new()
    }
}
