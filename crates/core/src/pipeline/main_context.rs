use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

type Task = Box<dyn FnOnce() + Send>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("main context is closed")]
pub struct MainContextClosed;

/// Handle for posting work onto the designated main context.
///
/// Tasks run one at a time, in posting order, on whichever thread drives the
/// matching [`MainLoop`].
#[derive(Clone)]
pub struct MainContext {
    tx: Sender<Task>,
}

impl MainContext {
    /// Queues `task`. If the loop is gone the task is dropped unrun, which
    /// still runs the destructors of everything it captured.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> Result<(), MainContextClosed> {
        self.tx.send(Box::new(task)).map_err(|_| MainContextClosed)
    }
}

/// The receiving side of a [`MainContext`].
pub struct MainLoop {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl MainLoop {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub fn context(&self) -> MainContext {
        MainContext {
            tx: self.tx.clone(),
        }
    }

    /// Runs every task queued right now; returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Runs tasks as they arrive until `done` returns true or `timeout`
    /// elapses. Returns whether `done` was reached.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // Short waits so `done` is re-checked even when nothing is posted.
            let wait = (deadline - now).min(Duration::from_millis(10));
            match self.rx.recv_timeout(wait) {
                Ok(task) => task(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return done(),
            }
        }
    }
}

impl Default for MainLoop {
    fn default() -> Self {
        Self::new()
    }
}
