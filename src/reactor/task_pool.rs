// Copyright (c) 2026 The ecewo developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crossbeam_channel::{unbounded, Sender};
use std::thread;

/// Manages the fixed pool of worker threads blocking jobs run on.
///
/// Workers never touch reactor state: a job sees only what was moved
/// into it, and results travel back to the loop through the completion
/// channel. Dropping the pool closes the job channel, which is the
/// workers' signal to stop.
pub struct TaskPool {
    todo: Sender<Box<dyn FnOnce() + Send>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl TaskPool {
    /// Initializes the pool with one worker per CPU.
    pub fn new() -> TaskPool {
        TaskPool::with_threads(num_cpus::get().max(1))
    }

    pub fn with_threads(count: usize) -> TaskPool {
        let (todo, rx) = unbounded::<Box<dyn FnOnce() + Send>>();

        let workers = (0..count.max(1))
            .map(|_| {
                let rx = rx.clone();
                thread::spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
            })
            .collect();

        TaskPool { todo, workers }
    }

    /// Executes a function on a worker thread.
    #[inline]
    pub fn spawn<F>(&self, code: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.todo.send(Box::new(code)).is_err() {
            log::error!("worker pool is shut down, job dropped");
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // Disconnect the channel, then wait for in-flight jobs.
        let (closed, _) = unbounded();
        self.todo = closed;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
