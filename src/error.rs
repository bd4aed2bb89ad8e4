//! Error types shared across the crate.
//!
//! The taxonomy separates errors a caller may want to retry (connect
//! timeouts) from those it must not (rejected submissions, closed handles).
//! All variants are cheaply cloneable so a single failure can be observed by
//! every waiter on a completion future; I/O causes are kept behind an `Arc`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Work was submitted to a reactor that is already shut down. Never
    /// retried automatically.
    #[error("task rejected: event loop is {0}")]
    Rejected(&'static str),

    /// A configuration value that can never work, caught at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The connect attempt did not complete within the configured timeout.
    /// Distinct from [`Error::Connect`] so callers can apply a different
    /// retry policy.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A native connect failure other than a timeout.
    #[error("connect failed: {0}")]
    Connect(String),

    /// A read or write failed with something other than clean end-of-stream.
    /// End-of-stream is not an error and never produces this variant.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    /// The channel was closed before or while the operation was pending.
    #[error("channel is closed")]
    ChannelClosed,

    /// An operation touched a registration binding that was already
    /// invalidated. Fails fast instead of touching freed state.
    #[error("handle is closed")]
    HandleClosed,

    /// A dispatcher-side accept or socket handoff failed. Logged and the
    /// socket closed on the dispatcher side; never surfaced to a peer
    /// channel, because none exists yet.
    #[error("accept handoff failed: {0}")]
    Handoff(String),

    /// The reactor's event loop terminated abnormally. Carried by the
    /// termination future to every waiter.
    #[error("event loop terminated: {0}")]
    LoopTerminated(String),

    /// A handle was registered against a reactor that does not own it.
    /// Fatal: a handle must only ever be driven by the loop that owns it.
    /// `executing` is `None` when the offending thread is not a loop thread.
    #[error(
        "handle owned by loop {owner} registered from {}",
        .executing.map_or_else(|| "a foreign thread".to_string(), |id| format!("loop {id}"))
    )]
    AffinityMismatch { owner: u64, executing: Option<u64> },
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ConnectTimeout(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        Error::Io(Arc::new(io::Error::from(err)))
    }
}
