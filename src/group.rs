//! A fixed pool of reactors sharing one epoch.
//!
//! Connection-oriented servers scale across cores by spreading channels over
//! the pool; assignment is round-robin by an atomically incremented counter.
//! The pool captures the process-wide monotonic epoch once, at construction,
//! and hands the same value to every member loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::promise::TerminationFuture;
use crate::reactor::Reactor;

pub const DEFAULT_POOL_CAPACITY: usize = 4;

pub struct ReactorPool {
    reactors: Vec<Reactor>,
    next: AtomicUsize,
}

impl ReactorPool {
    /// Creates and starts `capacity` reactors. All members share the epoch
    /// captured here.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig("pool capacity must be non-zero"));
        }
        let epoch = Instant::now();
        let mut reactors = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            let reactor = Reactor::with_epoch(epoch)?;
            reactor.start()?;
            reactors.push(reactor);
        }
        Ok(Self {
            reactors,
            next: AtomicUsize::new(0),
        })
    }

    /// One reactor per available core.
    pub fn with_default_capacity() -> Result<Self> {
        let capacity = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_POOL_CAPACITY);
        Self::new(capacity)
    }

    /// Round-robin pick for the next channel or unit of work.
    pub fn next(&self) -> &Reactor {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        &self.reactors[index]
    }

    pub fn reactors(&self) -> &[Reactor] {
        &self.reactors
    }

    pub fn len(&self) -> usize {
        self.reactors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reactors.is_empty()
    }

    /// Requests graceful shutdown of every member and returns their
    /// termination futures in pool order.
    pub fn shutdown_gracefully(
        &self,
        quiet_period: Duration,
        timeout: Duration,
    ) -> Vec<TerminationFuture> {
        self.reactors
            .iter()
            .map(|r| r.shutdown_gracefully(quiet_period, timeout))
            .collect()
    }

    /// Shuts the pool down and blocks until every loop terminated or the
    /// deadline passed. Returns `false` on deadline.
    pub fn shutdown_and_wait(&self, quiet_period: Duration, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout.max(quiet_period) + Duration::from_secs(1);
        for future in self.shutdown_gracefully(quiet_period, timeout) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if future.wait_timeout(remaining).is_none() {
                return false;
            }
        }
        true
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        for reactor in &self.reactors {
            if !reactor.is_shutting_down() {
                reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(ReactorPool::new(0).is_err());
    }

    #[test]
    fn next_round_robins_across_members() {
        let pool = ReactorPool::new(3).unwrap();
        let picked: Vec<u64> = (0..6).map(|_| pool.next().id()).collect();
        assert_eq!(picked[0], picked[3]);
        assert_eq!(picked[1], picked[4]);
        assert_eq!(picked[2], picked[5]);
        assert_ne!(picked[0], picked[1]);
        pool.shutdown_and_wait(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn members_share_the_epoch() {
        let pool = ReactorPool::new(2).unwrap();
        assert_eq!(pool.reactors()[0].epoch(), pool.reactors()[1].epoch());
        pool.shutdown_and_wait(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn shutdown_and_wait_terminates_every_member() {
        let pool = ReactorPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for reactor in pool.reactors() {
            let counter = counter.clone();
            reactor
                .execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert!(pool.shutdown_and_wait(Duration::ZERO, Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        for reactor in pool.reactors() {
            assert!(reactor.is_terminated());
        }
    }
}
