//! Blocking wait with timeout over shared state
//!
//! A [`WaitQueue`] owns a value behind a mutex and a condition variable.
//! Writers go through [`WaitQueue::update`], which wakes every waiter;
//! waiters block in [`WaitQueue::wait_until`] until their predicate holds,
//! the timeout expires, or the queue is interrupted.
//!
//! Deadlines are read from the queue's [`Clock`]. The condition variable
//! sleeps for at most the time the clock says is left, and a sleep that runs
//! out ends the wait; a clock that jumps past the deadline is seen on the
//! next wakeup.

use crate::transport::Clock;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How a blocking wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate held.
    Reached,
    /// The timeout expired first.
    TimedOut,
    /// [`WaitQueue::interrupt`] was called while waiting.
    Interrupted,
}

#[derive(Debug)]
struct Inner<T> {
    value: T,
    generation: u64,
}

/// Shared value with condition-variable wakeups.
#[derive(Debug)]
pub struct WaitQueue<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
    clock: Arc<dyn Clock>,
}

impl<T> WaitQueue<T> {
    /// Wrap `value`, timing waits with `clock`.
    pub fn new(value: T, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                value,
                generation: 0,
            }),
            cond: Condvar::new(),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock().value)
    }

    /// Mutate the value and wake all waiters.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let r = f(&mut self.lock().value);
        self.cond.notify_all();
        r
    }

    /// Wake all waiters so they re-check their predicates.
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Make every current waiter return [`WaitOutcome::Interrupted`].
    pub fn interrupt(&self) {
        self.lock().generation += 1;
        self.cond.notify_all();
    }

    /// Block until `pred` holds, `timeout` expires, or the queue is interrupted.
    pub fn wait_until(&self, mut pred: impl FnMut(&T) -> bool, timeout: Duration) -> WaitOutcome {
        let deadline = self.clock.now() + timeout;
        let mut guard = self.lock();
        let generation = guard.generation;
        loop {
            if pred(&guard.value) {
                return WaitOutcome::Reached;
            }
            if guard.generation != generation {
                return WaitOutcome::Interrupted;
            }
            let now = self.clock.now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let (next, slept) = self
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
            if slept.timed_out() && !pred(&guard.value) && guard.generation == generation {
                return WaitOutcome::TimedOut;
            }
        }
    }
}
