//! Completion futures resolved on a loop thread and observed cross-thread.
//!
//! A [`Promise`] is a one-shot completion cell. The side that resolves it and
//! the side that waits on it hold clones of the same handle. Completion is
//! first-write-wins: `try_succeed`/`try_fail` report whether the caller won,
//! which is what lets a connect completion and its timeout task race without
//! either assuming it was first.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

struct Cell<T> {
    result: Mutex<Option<Result<T>>>,
    cond: Condvar,
}

pub struct Promise<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(Cell {
                result: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Resolves the promise successfully. Returns `false` if it was already
    /// resolved, in which case the value is dropped.
    pub fn try_succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Fails the promise. Returns `false` if it was already resolved.
    pub fn try_fail(&self, err: Error) -> bool {
        self.complete(Err(err))
    }

    fn complete(&self, result: Result<T>) -> bool {
        let mut slot = self.cell.result.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        self.cell.cond.notify_all();
        true
    }

    pub fn is_done(&self) -> bool {
        self.cell.result.lock().unwrap().is_some()
    }
}

impl<T: Clone> Promise<T> {
    /// Non-blocking peek at the outcome.
    pub fn result(&self) -> Option<Result<T>> {
        self.cell.result.lock().unwrap().clone()
    }

    /// Blocks until the promise resolves.
    pub fn wait(&self) -> Result<T> {
        let mut slot = self.cell.result.lock().unwrap();
        while slot.is_none() {
            slot = self.cell.cond.wait(slot).unwrap();
        }
        slot.clone().unwrap()
    }

    /// Blocks until the promise resolves or the timeout elapses. Returns
    /// `None` on timeout; the promise itself is left unresolved.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.cell.result.lock().unwrap();
        while slot.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, res) = self
                .cell
                .cond
                .wait_timeout(slot, deadline - now)
                .unwrap();
            slot = guard;
            if res.timed_out() && slot.is_none() {
                return None;
            }
        }
        slot.clone()
    }
}

/// Future resolved when a reactor reaches its terminal state. Carries the
/// fatal cause, if any, to every waiter.
pub type TerminationFuture = Promise<()>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn construction_needs_no_clone_bound() {
        struct Opaque;
        let p: Promise<Opaque> = Promise::new();
        assert!(p.try_succeed(Opaque));

        let d: Promise<u32> = Promise::default();
        assert!(!d.is_done());
        assert!(d.try_succeed(7));
        assert_eq!(d.wait().unwrap(), 7);
    }

    #[test]
    fn first_completion_wins() {
        let p: Promise<u32> = Promise::new();
        assert!(p.try_succeed(1));
        assert!(!p.try_succeed(2));
        assert!(!p.try_fail(Error::ChannelClosed));
        assert_eq!(p.wait().unwrap(), 1);
    }

    #[test]
    fn failure_reaches_every_waiter() {
        let p: Promise<()> = Promise::new();
        let mut joins = Vec::new();
        for _ in 0..4 {
            let observer = p.clone();
            joins.push(thread::spawn(move || observer.wait()));
        }
        thread::sleep(Duration::from_millis(20));
        assert!(p.try_fail(Error::LoopTerminated("poll failed".into())));
        for join in joins {
            let outcome = join.join().unwrap();
            assert!(matches!(outcome, Err(Error::LoopTerminated(_))));
        }
    }

    #[test]
    fn wait_timeout_leaves_promise_pending() {
        let p: Promise<()> = Promise::new();
        assert!(p.wait_timeout(Duration::from_millis(10)).is_none());
        assert!(!p.is_done());
        assert!(p.try_succeed(()));
        assert!(p.wait_timeout(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn racing_resolvers_produce_exactly_one_winner() {
        for _ in 0..50 {
            let p: Promise<&'static str> = Promise::new();
            let a = p.clone();
            let b = p.clone();
            let ta = thread::spawn(move || a.try_succeed("a"));
            let tb = thread::spawn(move || b.try_succeed("b"));
            let won_a = ta.join().unwrap();
            let won_b = tb.join().unwrap();
            assert!(won_a ^ won_b);
            let value = p.wait().unwrap();
            assert!((value == "a") == won_a);
        }
    }
}
