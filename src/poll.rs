//! Cross-thread view of a reactor's polling machinery.
//!
//! The `mio::Poll` itself lives on the loop thread; what the rest of the
//! process needs is the registry clone (registration is marshalled onto the
//! loop thread anyway) and the waker. The waker is guarded so that no wakeup
//! is ever issued after loop close has been scheduled, at which point the
//! poll it would target is about to be released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::error::Result;

/// Token reserved for the wakeup handle. Source tokens are allocated from
/// zero upward and can never collide with it.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

pub(crate) struct PollHandle {
    registry: Registry,
    waker: Waker,
    wake_disarmed: AtomicBool,
}

impl PollHandle {
    pub(crate) fn new(poll: &Poll) -> std::io::Result<Self> {
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            registry,
            waker,
            wake_disarmed: AtomicBool::new(false),
        })
    }

    pub(crate) fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        source.register(&self.registry, token, interest)?;
        Ok(())
    }

    pub(crate) fn reregister<S>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        source.reregister(&self.registry, token, interest)?;
        Ok(())
    }

    pub(crate) fn deregister<S>(&self, source: &mut S) -> Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        source.deregister(&self.registry)?;
        Ok(())
    }

    /// Interrupts a blocking poll. A no-op once [`Self::disarm_wake`] has run.
    pub(crate) fn wake(&self) {
        if self.wake_disarmed.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.waker.wake() {
            log::warn!("failed to wake event loop: {err}");
        }
    }

    /// Called when loop close is scheduled. From here on the waker no longer
    /// keeps the loop alive and must not be fired.
    pub(crate) fn disarm_wake(&self) {
        self.wake_disarmed.store(true, Ordering::Release);
    }

    pub(crate) fn poll(
        poll: &mut Poll,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> std::io::Result<()> {
        poll.poll(events, timeout)
    }
}
