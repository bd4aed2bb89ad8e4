//! The connection-scoped channel and its state machine.
//!
//! A [`TcpChannel`] is bound to exactly one reactor and one registered
//! socket. Its lifecycle state is a bitmask of four independent flags rather
//! than an enum, because the flags are not mutually exclusive: an active
//! channel routinely has a write batch in flight.
//!
//! ```text
//!   OPEN ──connect/adopt──▶ OPEN|ACTIVE ──▶ OPEN|ACTIVE|READ_SCHEDULED
//!                                   │                 │
//!                                 close       flush ──▶ |WRITE_SCHEDULED
//!                                   ▼
//!                            (all flags cleared, handle close confirmed)
//! ```
//!
//! All socket access happens on the owning reactor's loop thread; the public
//! methods marshal through [`crate::reactor::Reactor::execute`] when called from
//! anywhere else. Handler callbacks are never invoked while internal locks
//! are held, so handlers may freely write, flush, read, or close from inside
//! a notification.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::config::ChannelConfig;
use crate::error::{Error, Result};
use crate::handle::EventSink;
use crate::handler::ChannelHandler;
use crate::promise::Promise;
use crate::reactor::{Reactor, ScheduledHandle};

pub(crate) mod flags {
    pub const OPEN: u8 = 0b0001;
    pub const ACTIVE: u8 = 0b0010;
    pub const READ_SCHEDULED: u8 = 0b0100;
    pub const WRITE_SCHEDULED: u8 = 0b1000;
}

/// Bitmask channel state. Flags toggle independently; `contains` asks about
/// all bits of the given mask.
pub(crate) struct ChannelState(AtomicU8);

impl ChannelState {
    fn new(initial: u8) -> Self {
        Self(AtomicU8::new(initial))
    }

    /// Sets `mask`, returning `true` when at least one bit was newly set.
    fn set(&self, mask: u8) -> bool {
        let previous = self.0.fetch_or(mask, Ordering::AcqRel);
        previous & mask != mask
    }

    fn clear(&self, mask: u8) {
        self.0.fetch_and(!mask, Ordering::AcqRel);
    }

    fn contains(&self, mask: u8) -> bool {
        self.0.load(Ordering::Acquire) & mask == mask
    }

    fn load(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

struct PendingWrite {
    buf: Vec<u8>,
    offset: usize,
    promise: Promise<usize>,
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<PendingWrite>,
    bytes: usize,
}

struct ConnectInFlight {
    promise: Promise<()>,
    timeout: Option<ScheduledHandle>,
}

#[derive(Default)]
struct ChannelIo {
    stream: Option<TcpStream>,
    token: Option<Token>,
    current_interest: Option<Interest>,
    wait_writable: bool,
    read_requested: bool,
    connecting: Option<ConnectInFlight>,
    outbound: Outbound,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    close_requested: bool,
    was_active_at_close: bool,
}

struct ChannelShared {
    reactor: Reactor,
    config: ChannelConfig,
    handler: Arc<dyn ChannelHandler>,
    state: ChannelState,
    // Loop-thread confined by protocol; the mutex covers the brief windows
    // in which cross-thread submissions inspect addresses or byte counts.
    io: Mutex<ChannelIo>,
    close_promise: Promise<()>,
}

#[derive(Clone)]
pub struct TcpChannel {
    shared: Arc<ChannelShared>,
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("reactor", &self.shared.reactor.id())
            .field("state", &self.shared.state.load())
            .field("remote", &self.remote_addr())
            .finish()
    }
}

impl TcpChannel {
    /// A fresh, unconnected channel bound to `reactor`.
    pub fn new<H>(reactor: &Reactor, config: ChannelConfig, handler: H) -> Self
    where
        H: ChannelHandler,
    {
        Self::with_shared_handler(reactor, config, Arc::new(handler))
    }

    /// Same as [`TcpChannel::new`] but sharing one handler across channels,
    /// the way a server shares its handler across adopted connections.
    pub fn with_shared_handler(
        reactor: &Reactor,
        config: ChannelConfig,
        handler: Arc<dyn ChannelHandler>,
    ) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                reactor: reactor.clone(),
                config,
                handler,
                state: ChannelState::new(flags::OPEN),
                io: Mutex::new(ChannelIo::default()),
                close_promise: Promise::new(),
            }),
        }
    }

    /// Adopts an already-connected socket (an accept handoff) into
    /// `reactor`'s loop. Must run on that loop's thread: a handle may only
    /// ever be driven by the loop that owns it.
    pub(crate) fn adopt(
        reactor: &Reactor,
        config: ChannelConfig,
        handler: Arc<dyn ChannelHandler>,
        stream: std::net::TcpStream,
    ) -> Result<Self> {
        if !reactor.in_event_loop() {
            return Err(Error::AffinityMismatch {
                owner: reactor.id(),
                executing: crate::reactor::current_loop_id(),
            });
        }

        stream.set_nonblocking(true)?;
        apply_socket_options(&stream, &config);
        let mut mio_stream = TcpStream::from_std(stream);
        let local = mio_stream.local_addr().ok();
        let remote = mio_stream.peer_addr().ok();

        let channel = Self::with_shared_handler(reactor, config, handler);
        let token = reactor.table().next_token();
        reactor.table().pin(token, Arc::new(channel.clone()), true);
        let interest = Interest::READABLE;
        if let Err(err) = reactor.poll_handle().register(&mut mio_stream, token, interest) {
            reactor.table().unpin(token);
            return Err(err);
        }

        {
            let mut io = channel.shared.io.lock().unwrap();
            io.stream = Some(mio_stream);
            io.token = Some(token);
            io.current_interest = Some(interest);
            io.local = local;
            io.remote = remote;
        }
        channel.shared.state.set(flags::ACTIVE);
        channel.shared.handler.on_active(&channel);
        if channel.shared.config.auto_read {
            channel.begin_read();
        } else {
            channel.sync_interest();
        }
        Ok(channel)
    }

    pub fn reactor(&self) -> &Reactor {
        &self.shared.reactor
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.contains(flags::OPEN)
    }

    pub fn is_active(&self) -> bool {
        self.shared.state.contains(flags::ACTIVE)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.io.lock().unwrap().local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.io.lock().unwrap().remote
    }

    /// Bytes queued but not yet written to the socket. Producers can use
    /// this to throttle.
    pub fn outbound_bytes(&self) -> usize {
        self.shared.io.lock().unwrap().outbound.bytes
    }

    /// Initiates a non-blocking connect, binding `local` first when given.
    /// The returned future resolves on the loop thread; a configured connect
    /// timeout races against completion and exactly one of them wins it.
    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Promise<()> {
        let promise = Promise::new();
        let handoff = promise.clone();
        let submitted = self.run_on_loop(move |ch| ch.do_connect(remote, local, handoff));
        if let Err(err) = submitted {
            promise.try_fail(err);
        }
        promise
    }

    /// Queues `data` on the outbound buffer without flushing. The future
    /// resolves with the payload length once the bytes reached the socket.
    pub fn write(&self, data: Vec<u8>) -> Promise<usize> {
        let promise = Promise::new();
        let handoff = promise.clone();
        let submitted = self.run_on_loop(move |ch| ch.do_write(data, handoff));
        if let Err(err) = submitted {
            promise.try_fail(err);
        }
        promise
    }

    /// Starts (or defers into) a write batch for everything queued.
    pub fn flush(&self) {
        let _ = self.run_on_loop(|ch| ch.do_flush());
    }

    pub fn write_and_flush(&self, data: Vec<u8>) -> Promise<usize> {
        let promise = Promise::new();
        let handoff = promise.clone();
        let submitted = self.run_on_loop(move |ch| {
            ch.do_write(data, handoff);
            ch.do_flush();
        });
        if let Err(err) = submitted {
            promise.try_fail(err);
        }
        promise
    }

    /// Requests one more read burst when auto-read is disabled.
    pub fn read(&self) {
        let _ = self.run_on_loop(|ch| {
            ch.shared.io.lock().unwrap().read_requested = true;
            ch.begin_read();
        });
    }

    /// Closes the channel: resets OPEN/ACTIVE, stops reads, fails pending
    /// work, and two-phase-closes the underlying registration. Idempotent;
    /// every call observes the same close future.
    pub fn close(&self) -> Promise<()> {
        let promise = self.shared.close_promise.clone();
        let submitted = self.run_on_loop(|ch| ch.do_close());
        if submitted.is_err() {
            // The loop is gone; tear down from the calling thread.
            self.force_teardown();
        }
        promise
    }

    pub fn close_future(&self) -> Promise<()> {
        self.shared.close_promise.clone()
    }

    fn run_on_loop<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&TcpChannel) + Send + 'static,
    {
        if self.shared.reactor.in_event_loop() {
            f(self);
            Ok(())
        } else {
            let channel = self.clone();
            self.shared.reactor.execute(move || f(&channel))
        }
    }

    // ---- loop-thread operations ----

    fn do_connect(&self, remote: SocketAddr, local: Option<SocketAddr>, promise: Promise<()>) {
        if !self.shared.state.contains(flags::OPEN) {
            promise.try_fail(Error::ChannelClosed);
            return;
        }
        {
            let io = self.shared.io.lock().unwrap();
            if io.connecting.is_some() || io.stream.is_some() {
                drop(io);
                promise.try_fail(Error::Connect(
                    "channel is already connecting or connected".into(),
                ));
                return;
            }
        }

        let mut stream = match open_stream(remote, local) {
            Ok(stream) => stream,
            Err(err) => {
                promise.try_fail(Error::Connect(err.to_string()));
                return;
            }
        };

        let token = self.shared.reactor.table().next_token();
        self.shared
            .reactor
            .table()
            .pin(token, Arc::new(self.clone()), true);
        if let Err(err) =
            self.shared
                .reactor
                .poll_handle()
                .register(&mut stream, token, Interest::WRITABLE)
        {
            self.shared.reactor.table().unpin(token);
            promise.try_fail(err);
            return;
        }

        let timeout = self
            .shared
            .config
            .connect_timeout
            .filter(|t| !t.is_zero())
            .and_then(|delay| {
                let racing = promise.clone();
                let channel = self.clone();
                self.shared
                    .reactor
                    .schedule(delay, move || {
                        // The native completion may already have won; only
                        // the winner acts.
                        if racing.try_fail(Error::ConnectTimeout(delay)) {
                            channel.close();
                        }
                    })
                    .ok()
            });

        let mut io = self.shared.io.lock().unwrap();
        io.stream = Some(stream);
        io.token = Some(token);
        io.current_interest = Some(Interest::WRITABLE);
        io.connecting = Some(ConnectInFlight { promise, timeout });
    }

    fn finish_connect(&self) {
        enum Outcome {
            Success {
                inflight: ConnectInFlight,
            },
            Failure {
                inflight: ConnectInFlight,
                err: Error,
            },
        }

        enum Handshake {
            StillConnecting,
            Established(SocketAddr, Option<SocketAddr>),
            Failed(Error),
        }

        let outcome = {
            let mut io = self.shared.io.lock().unwrap();
            let Some(inflight) = io.connecting.take() else {
                return;
            };
            let handshake = match io.stream.as_ref() {
                // The binding vanished out from under the connect.
                None => Handshake::Failed(Error::HandleClosed),
                Some(stream) => match stream.take_error() {
                    Ok(Some(err)) | Err(err) => {
                        Handshake::Failed(Error::Connect(err.to_string()))
                    }
                    Ok(None) => match stream.peer_addr() {
                        Ok(addr) => Handshake::Established(addr, stream.local_addr().ok()),
                        Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                            Handshake::StillConnecting
                        }
                        Err(err) => Handshake::Failed(Error::Connect(err.to_string())),
                    },
                },
            };
            match handshake {
                Handshake::StillConnecting => {
                    // Spurious wakeup; keep waiting.
                    io.connecting = Some(inflight);
                    return;
                }
                Handshake::Established(remote, local) => {
                    io.remote = Some(remote);
                    io.local = local;
                    io.wait_writable = false;
                    self.sync_interest_locked(&mut io);
                    Outcome::Success { inflight }
                }
                Handshake::Failed(err) => Outcome::Failure { inflight, err },
            }
        };

        match outcome {
            Outcome::Success { inflight } => {
                if let Some(timer) = inflight.timeout {
                    timer.cancel();
                }
                self.shared.state.set(flags::ACTIVE);
                let won = inflight.promise.try_succeed(());
                if !won {
                    log::debug!(
                        "connect on loop {} completed after its promise was resolved",
                        self.shared.reactor.id()
                    );
                }
                // Something happened; report what happened. The activation
                // notification is not gated on winning the promise race.
                self.shared.handler.on_active(self);
                if self.shared.config.auto_read {
                    self.begin_read();
                }
                // A flush issued while the connect was still in flight left
                // its batch parked; the socket can carry it now.
                if self.shared.state.contains(flags::WRITE_SCHEDULED) {
                    self.flush_now();
                }
            }
            Outcome::Failure { inflight, err } => {
                if let Some(timer) = inflight.timeout {
                    timer.cancel();
                }
                inflight.promise.try_fail(err);
                self.close();
            }
        }
    }

    fn begin_read(&self) {
        if !self.shared.state.contains(flags::ACTIVE) {
            return;
        }
        self.shared.state.set(flags::READ_SCHEDULED);
        self.sync_interest();
    }

    fn do_read(&self) {
        if !self.shared.state.contains(flags::READ_SCHEDULED) {
            return;
        }
        let mut buffer = self.shared.reactor.buffer_pool().acquire();
        if buffer.len() != self.shared.config.buffer_size {
            buffer.resize(self.shared.config.buffer_size, 0);
        }

        let mut end_of_stream = false;
        let mut failure: Option<io::Error> = None;
        let mut drained = false;
        loop {
            let read = {
                let mut io = self.shared.io.lock().unwrap();
                match io.stream.as_mut() {
                    Some(stream) => stream.read(&mut buffer[..]),
                    None => return,
                }
            };
            match read {
                // End of stream releases the buffer without forwarding.
                Ok(0) => {
                    end_of_stream = true;
                    break;
                }
                Ok(n) => self.shared.handler.on_read(self, &buffer[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    drained = true;
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            self.shared.handler.on_exception(self, err.into());
            self.close();
            return;
        }
        if end_of_stream {
            self.close();
            return;
        }
        if drained {
            self.shared.handler.on_read_complete(self);
            let mut io = self.shared.io.lock().unwrap();
            if !self.shared.config.auto_read && !io.read_requested {
                self.shared.state.clear(flags::READ_SCHEDULED);
                self.sync_interest_locked(&mut io);
            }
            io.read_requested = false;
        }
    }

    fn do_write(&self, data: Vec<u8>, promise: Promise<usize>) {
        if !self.shared.state.contains(flags::OPEN) {
            promise.try_fail(Error::ChannelClosed);
            return;
        }
        let mut io = self.shared.io.lock().unwrap();
        io.outbound.bytes += data.len();
        io.outbound.queue.push_back(PendingWrite {
            buf: data,
            offset: 0,
            promise,
        });
    }

    fn do_flush(&self) {
        // At most one in-flight batch: a flush while one is active defers
        // to its writable-completion path instead of double-submitting.
        if !self.shared.state.set(flags::WRITE_SCHEDULED) {
            return;
        }
        self.flush_now();
    }

    fn continue_flush(&self) {
        if !self.shared.state.contains(flags::WRITE_SCHEDULED) {
            let mut io = self.shared.io.lock().unwrap();
            if io.wait_writable {
                io.wait_writable = false;
                self.sync_interest_locked(&mut io);
            }
            return;
        }
        self.flush_now();
    }

    fn flush_now(&self) {
        let mut completed: Vec<(Promise<usize>, usize)> = Vec::new();
        let mut failure: Option<(io::Error, Vec<Promise<usize>>)> = None;
        {
            let mut io = self.shared.io.lock().unwrap();
            let snapshot = &mut *io;
            let Some(stream) = snapshot.stream.as_mut() else {
                self.shared.state.clear(flags::WRITE_SCHEDULED);
                return;
            };
            let outbound = &mut snapshot.outbound;

            let mut blocked = false;
            let mut error: Option<io::Error> = None;
            'batch: while let Some(front) = outbound.queue.front_mut() {
                while front.offset < front.buf.len() {
                    match stream.write(&front.buf[front.offset..]) {
                        Ok(0) => {
                            error = Some(io::ErrorKind::WriteZero.into());
                            break 'batch;
                        }
                        Ok(n) => {
                            front.offset += n;
                            outbound.bytes = outbound.bytes.saturating_sub(n);
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            blocked = true;
                            break 'batch;
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            error = Some(err);
                            break 'batch;
                        }
                    }
                }
                if let Some(done) = outbound.queue.pop_front() {
                    completed.push((done.promise, done.buf.len()));
                }
            }

            if let Some(err) = error {
                let pending = outbound.queue.drain(..).map(|w| w.promise).collect();
                outbound.bytes = 0;
                failure = Some((err, pending));
            } else if blocked {
                // Batch stays in flight; resume on the next writable event.
                snapshot.wait_writable = true;
                self.sync_interest_locked(snapshot);
            } else {
                self.shared.state.clear(flags::WRITE_SCHEDULED);
                snapshot.wait_writable = false;
                self.sync_interest_locked(snapshot);
            }
        }

        for (promise, len) in completed {
            promise.try_succeed(len);
        }
        if let Some((err, pending)) = failure {
            let shared_err: Error = err.into();
            for promise in pending {
                promise.try_fail(shared_err.clone());
            }
            self.shared.state.clear(flags::WRITE_SCHEDULED);
            self.shared.handler.on_exception(self, shared_err);
            self.close();
        }
    }

    fn do_close(&self) {
        let token = {
            let mut io = self.shared.io.lock().unwrap();
            if io.close_requested {
                return;
            }
            io.close_requested = true;
            io.was_active_at_close = self.shared.state.contains(flags::ACTIVE);
            io.token
        };
        self.shared.state.clear(
            flags::OPEN | flags::ACTIVE | flags::READ_SCHEDULED | flags::WRITE_SCHEDULED,
        );
        if let Some(token) = token {
            self.shared.reactor.table().mark_closing(token);
            // A closing channel no longer holds its loop open.
            self.shared.reactor.table().set_keep_alive(token, false);
        }

        // Phase two runs as its own task: the registration is not free for
        // reuse until the loop has stopped dispatching to it.
        let channel = self.clone();
        let confirmed = self.shared.reactor.execute(move || {
            if let Some(token) = token {
                channel.shared.reactor.table().unpin(token);
            }
            channel.finish_close();
        });
        if confirmed.is_err() {
            if let Some(token) = token {
                self.shared.reactor.table().unpin(token);
            }
            self.finish_close();
        }
    }

    /// Phase two of close, and the terminal teardown path when the owning
    /// loop itself winds down.
    fn finish_close(&self) {
        let (stream, inflight, pending_writes, fire_inactive) = {
            let mut io = self.shared.io.lock().unwrap();
            let stream = io.stream.take();
            io.token = None;
            io.current_interest = None;
            io.wait_writable = false;
            let inflight = io.connecting.take();
            let pending: Vec<Promise<usize>> = io.outbound.queue.drain(..).map(|w| w.promise).collect();
            io.outbound.bytes = 0;
            (stream, inflight, pending, io.was_active_at_close)
        };

        if let Some(mut stream) = stream {
            let _ = self.shared.reactor.poll_handle().deregister(&mut stream);
            // Dropping the stream releases the descriptor.
        }
        if let Some(inflight) = inflight {
            if let Some(timer) = inflight.timeout {
                timer.cancel();
            }
            inflight.promise.try_fail(Error::ChannelClosed);
        }
        for promise in pending_writes {
            promise.try_fail(Error::ChannelClosed);
        }
        if fire_inactive {
            self.shared.handler.on_inactive(self);
        }
        self.shared.close_promise.try_succeed(());
    }

    fn force_teardown(&self) {
        {
            let mut io = self.shared.io.lock().unwrap();
            if io.close_requested {
                return;
            }
            io.close_requested = true;
            io.was_active_at_close = self.shared.state.contains(flags::ACTIVE);
        }
        self.shared.state.clear(
            flags::OPEN | flags::ACTIVE | flags::READ_SCHEDULED | flags::WRITE_SCHEDULED,
        );
        self.finish_close();
    }

    fn sync_interest(&self) {
        let mut io = self.shared.io.lock().unwrap();
        self.sync_interest_locked(&mut io);
    }

    /// Reconciles the poll registration with what the channel currently
    /// wants to hear about.
    fn sync_interest_locked(&self, io: &mut ChannelIo) {
        let (Some(token), Some(stream)) = (io.token, io.stream.as_mut()) else {
            return;
        };
        let want_read = self.shared.state.contains(flags::READ_SCHEDULED);
        let want_write = io.wait_writable || io.connecting.is_some();
        let desired = match (want_read, want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        if desired == io.current_interest {
            return;
        }
        let handle = self.shared.reactor.poll_handle();
        let applied = match (io.current_interest, desired) {
            (None, Some(interest)) => handle.register(stream, token, interest),
            (Some(_), Some(interest)) => handle.reregister(stream, token, interest),
            (Some(_), None) => handle.deregister(stream),
            (None, None) => Ok(()),
        };
        match applied {
            Ok(()) => io.current_interest = desired,
            Err(err) => log::warn!("failed to update poll interest: {err}"),
        }
    }

    fn is_connecting(&self) -> bool {
        self.shared.io.lock().unwrap().connecting.is_some()
    }
}

impl EventSink for TcpChannel {
    fn on_ready(&self, readable: bool, writable: bool) {
        if writable {
            if self.is_connecting() {
                self.finish_connect();
            } else {
                self.continue_flush();
            }
        }
        if readable {
            self.do_read();
        }
    }

    fn close_completed(&self) {
        self.force_teardown();
    }
}

fn open_stream(remote: SocketAddr, local: Option<SocketAddr>) -> io::Result<TcpStream> {
    match local {
        None => TcpStream::connect(remote),
        Some(local) => bind_and_connect(remote, local),
    }
}

/// Bind-before-connect needs the socket built by hand; mio only exposes the
/// plain connect path.
fn bind_and_connect(remote: SocketAddr, local: SocketAddr) -> io::Result<TcpStream> {
    use nix::sys::socket::{
        bind, connect, socket, AddressFamily, SockFlag, SockType, SockaddrStorage,
    };

    let family = if remote.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    let fd: OwnedFd = socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(io::Error::from)?;
    bind(fd.as_raw_fd(), &SockaddrStorage::from(local)).map_err(io::Error::from)?;
    match connect(fd.as_raw_fd(), &SockaddrStorage::from(remote)) {
        Ok(()) | Err(nix::errno::Errno::EINPROGRESS) => {}
        Err(err) => return Err(err.into()),
    }
    Ok(TcpStream::from_std(std::net::TcpStream::from(fd)))
}

pub(crate) fn apply_socket_options(stream: &std::net::TcpStream, config: &ChannelConfig) {
    if let Err(err) = stream.set_nodelay(config.no_delay) {
        log::warn!("failed to set TCP_NODELAY: {err}");
    }
    if config.keep_alive {
        if let Err(err) =
            nix::sys::socket::setsockopt(stream, nix::sys::socket::sockopt::KeepAlive, &true)
        {
            log::warn!("failed to set SO_KEEPALIVE: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recording {
        active: AtomicUsize,
        inactive: AtomicUsize,
        reads: StdMutex<Vec<u8>>,
        read_completes: AtomicUsize,
        errors: AtomicUsize,
        on_loop: AtomicUsize,
        off_loop: AtomicUsize,
    }

    struct RecordingHandler(Arc<Recording>);

    impl ChannelHandler for RecordingHandler {
        fn on_active(&self, channel: &TcpChannel) {
            self.record_thread(channel);
            self.0.active.fetch_add(1, Ordering::SeqCst);
        }

        fn on_read(&self, channel: &TcpChannel, data: &[u8]) {
            self.record_thread(channel);
            self.0.reads.lock().unwrap().extend_from_slice(data);
        }

        fn on_read_complete(&self, channel: &TcpChannel) {
            self.record_thread(channel);
            self.0.read_completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_inactive(&self, channel: &TcpChannel) {
            self.record_thread(channel);
            self.0.inactive.fetch_add(1, Ordering::SeqCst);
        }

        fn on_exception(&self, channel: &TcpChannel, _error: Error) {
            self.record_thread(channel);
            self.0.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl RecordingHandler {
        fn record_thread(&self, channel: &TcpChannel) {
            if channel.reactor().in_event_loop() {
                self.0.on_loop.fetch_add(1, Ordering::SeqCst);
            } else {
                self.0.off_loop.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn echo_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn state_flags_toggle_independently() {
        let state = ChannelState::new(flags::OPEN);
        assert!(state.contains(flags::OPEN));
        assert!(state.set(flags::ACTIVE | flags::WRITE_SCHEDULED));
        assert!(state.contains(flags::ACTIVE | flags::WRITE_SCHEDULED));
        // A second set of an already-set bit reports nothing new.
        assert!(!state.set(flags::WRITE_SCHEDULED));
        state.clear(flags::WRITE_SCHEDULED);
        assert!(state.contains(flags::ACTIVE));
        assert!(!state.contains(flags::WRITE_SCHEDULED));
    }

    #[test]
    fn connect_write_and_echo_round_trip() {
        let (listener, addr) = echo_listener();
        let echo = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            let n = peer.read(&mut buf).unwrap();
            peer.write_all(&buf[..n]).unwrap();
            // Hold the socket open until the client is done.
            let _ = peer.read(&mut buf);
        });

        let reactor = Reactor::new().unwrap();
        reactor.start().unwrap();
        let recording = Arc::new(Recording::default());
        let channel = TcpChannel::new(
            &reactor,
            ChannelConfig::default(),
            RecordingHandler(recording.clone()),
        );

        channel.connect(addr, None).wait().unwrap();
        wait_until(|| channel.is_active());
        assert_eq!(recording.active.load(Ordering::SeqCst), 1);

        let sent = channel.write_and_flush(b"ping".to_vec()).wait().unwrap();
        assert_eq!(sent, 4);
        wait_until(|| recording.reads.lock().unwrap().len() == 4);
        assert_eq!(&*recording.reads.lock().unwrap(), b"ping");
        assert!(recording.read_completes.load(Ordering::SeqCst) >= 1);
        // Every notification arrived on the loop thread.
        assert_eq!(recording.off_loop.load(Ordering::SeqCst), 0);

        channel.close().wait().unwrap();
        assert_eq!(recording.inactive.load(Ordering::SeqCst), 1);
        echo.join().unwrap();
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn local_bind_is_honored() {
        let (listener, addr) = echo_listener();
        let accept = thread::spawn(move || {
            let (peer, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(100));
            drop(peer);
        });

        let reactor = Reactor::new().unwrap();
        reactor.start().unwrap();
        let channel = TcpChannel::new(
            &reactor,
            ChannelConfig::default(),
            RecordingHandler(Arc::new(Recording::default())),
        );
        channel
            .connect(addr, Some("127.0.0.1:0".parse().unwrap()))
            .wait()
            .unwrap();
        let local = channel.local_addr().unwrap();
        assert_eq!(local.ip().to_string(), "127.0.0.1");

        channel.close().wait().unwrap();
        accept.join().unwrap();
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn connect_to_dead_port_fails_the_future() {
        let addr = {
            let (listener, addr) = echo_listener();
            drop(listener);
            addr
        };

        let reactor = Reactor::new().unwrap();
        reactor.start().unwrap();
        let channel = TcpChannel::new(
            &reactor,
            ChannelConfig::default(),
            RecordingHandler(Arc::new(Recording::default())),
        );
        let outcome = channel.connect(addr, None).wait();
        assert!(matches!(
            outcome,
            Err(Error::Connect(_)) | Err(Error::ConnectTimeout(_))
        ));
        assert!(!channel.is_active());
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn connect_race_resolves_exactly_once() {
        // A near-zero timeout races the loopback connect; whichever side
        // wins, the future resolves exactly once and activation implies
        // on_active.
        for _ in 0..10 {
            let (listener, addr) = echo_listener();
            let accept = thread::spawn(move || {
                let _ = listener.accept();
            });

            let reactor = Reactor::new().unwrap();
            reactor.start().unwrap();
            let recording = Arc::new(Recording::default());
            let config = ChannelConfig::builder()
                .connect_timeout(Some(Duration::from_nanos(1)))
                .build();
            let channel =
                TcpChannel::new(&reactor, config, RecordingHandler(recording.clone()));

            let outcome = channel.connect(addr, None).wait();
            match outcome {
                Ok(()) => {
                    wait_until(|| recording.active.load(Ordering::SeqCst) == 1);
                }
                Err(err) => {
                    assert!(err.is_timeout(), "unexpected failure: {err}");
                    // The losing completion may still activate before the
                    // forced close lands; the channel must end inactive.
                    wait_until(|| !channel.is_active());
                }
            }
            channel.close();
            reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
            accept.join().unwrap();
        }
    }

    #[test]
    fn writes_accumulate_until_flush() {
        let (listener, addr) = echo_listener();
        let accept = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut sink = Vec::new();
            let _ = peer.read_to_end(&mut sink);
            sink
        });

        let reactor = Reactor::new().unwrap();
        reactor.start().unwrap();
        let channel = TcpChannel::new(
            &reactor,
            ChannelConfig::default(),
            RecordingHandler(Arc::new(Recording::default())),
        );
        channel.connect(addr, None).wait().unwrap();

        let first = channel.write(vec![1u8; 100]);
        let second = channel.write(vec![2u8; 50]);
        wait_until(|| channel.outbound_bytes() == 150);
        assert!(!first.is_done());

        channel.flush();
        first.wait().unwrap();
        second.wait().unwrap();
        assert_eq!(channel.outbound_bytes(), 0);

        channel.close().wait().unwrap();
        let received = accept.join().unwrap();
        assert_eq!(received.len(), 150);
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn a_blocked_batch_defers_later_flushes() {
        let (listener, addr) = echo_listener();
        let reactor = Reactor::new().unwrap();
        reactor.start().unwrap();
        let channel = TcpChannel::new(
            &reactor,
            ChannelConfig::builder().auto_read(false).build(),
            RecordingHandler(Arc::new(Recording::default())),
        );
        channel.connect(addr, None).wait().unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        wait_until(|| channel.is_active());

        // More than the kernel buffers will take from an unread peer, so the
        // first batch blocks mid-flight.
        let first_len = 8 * 1024 * 1024;
        let first = channel.write_and_flush(vec![0xAA; first_len]);
        wait_until(|| channel.outbound_bytes() > 0);
        thread::sleep(Duration::from_millis(50));
        assert!(!first.is_done());
        assert!(channel.shared.state.contains(flags::WRITE_SCHEDULED));

        // A flush against the blocked batch defers to its completion path
        // instead of submitting a second batch.
        let second_len = 4096;
        let second = channel.write_and_flush(vec![0xBB; second_len]);
        thread::sleep(Duration::from_millis(50));
        assert!(!second.is_done());

        let total = first_len + second_len;
        let mut received = Vec::with_capacity(total);
        let mut buf = vec![0u8; 64 * 1024];
        while received.len() < total {
            let n = peer.read(&mut buf).unwrap();
            assert!(n > 0, "peer saw EOF before the batches finished");
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(first.wait().unwrap(), first_len);
        assert_eq!(second.wait().unwrap(), second_len);
        // Every byte exactly once, in submission order.
        assert_eq!(received.len(), total);
        assert!(received[..first_len].iter().all(|&b| b == 0xAA));
        assert!(received[first_len..].iter().all(|&b| b == 0xBB));
        wait_until(|| !channel.shared.state.contains(flags::WRITE_SCHEDULED));

        channel.close().wait().unwrap();
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn flush_during_connect_resumes_after_activation() {
        use nix::sys::socket::{
            accept, bind, getsockname, listen, socket, AddressFamily, Backlog, SockFlag,
            SockType, SockaddrIn,
        };
        use std::os::fd::FromRawFd;

        // A listener whose accept backlog is saturated leaves the next
        // connect attempt in flight until a slot frees up.
        let listener = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .unwrap();
        bind(listener.as_raw_fd(), &SockaddrIn::new(127, 0, 0, 1, 0)).unwrap();
        listen(&listener, Backlog::new(1).unwrap()).unwrap();
        let bound: SockaddrIn = getsockname(listener.as_raw_fd()).unwrap();
        let addr = SocketAddr::from((bound.ip(), bound.port()));

        let mut parked = Vec::new();
        for _ in 0..16 {
            match std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(300)) {
                Ok(stream) => parked.push(stream),
                Err(_) => break,
            }
        }
        assert!(!parked.is_empty(), "backlog never saturated");

        let reactor = Reactor::new().unwrap();
        reactor.start().unwrap();
        let channel = TcpChannel::new(
            &reactor,
            ChannelConfig::default(),
            RecordingHandler(Arc::new(Recording::default())),
        );
        let connect_future = channel.connect(addr, None);
        let write_future = channel.write_and_flush(b"early".to_vec());
        thread::sleep(Duration::from_millis(100));
        assert!(!channel.is_active());
        assert!(!write_future.is_done());

        // Draining the backlog lets the in-flight connect through on its
        // next retransmit; the parked batch must follow the activation.
        let drained: Vec<OwnedFd> = (0..parked.len())
            .map(|_| {
                let fd = accept(listener.as_raw_fd()).unwrap();
                // accept gave us the descriptor; own it for the test's life.
                unsafe { OwnedFd::from_raw_fd(fd) }
            })
            .collect();

        connect_future
            .wait_timeout(Duration::from_secs(10))
            .expect("connect never completed")
            .unwrap();
        let written = write_future
            .wait_timeout(Duration::from_secs(10))
            .expect("pre-activation flush never completed")
            .unwrap();
        assert_eq!(written, 5);
        wait_until(|| channel.is_active());

        channel.close().wait().unwrap();
        drop(drained);
        drop(parked);
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn close_is_idempotent_and_fires_inactive_once() {
        let (listener, addr) = echo_listener();
        let accept = thread::spawn(move || {
            let _ = listener.accept();
        });

        let reactor = Reactor::new().unwrap();
        reactor.start().unwrap();
        let recording = Arc::new(Recording::default());
        let channel = TcpChannel::new(
            &reactor,
            ChannelConfig::default(),
            RecordingHandler(recording.clone()),
        );
        channel.connect(addr, None).wait().unwrap();

        channel.close().wait().unwrap();
        channel.close().wait().unwrap();
        assert_eq!(recording.inactive.load(Ordering::SeqCst), 1);
        assert!(!channel.is_open());
        assert!(!channel.is_active());

        accept.join().unwrap();
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn disabled_auto_read_waits_for_explicit_read() {
        let (listener, addr) = echo_listener();
        let accept = thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            peer.write_all(b"early").unwrap();
            thread::sleep(Duration::from_millis(400));
            drop(peer);
        });

        let reactor = Reactor::new().unwrap();
        reactor.start().unwrap();
        let recording = Arc::new(Recording::default());
        let config = ChannelConfig::builder().auto_read(false).build();
        let channel = TcpChannel::new(&reactor, config, RecordingHandler(recording.clone()));
        channel.connect(addr, None).wait().unwrap();

        thread::sleep(Duration::from_millis(150));
        assert!(recording.reads.lock().unwrap().is_empty());

        channel.read();
        wait_until(|| recording.reads.lock().unwrap().len() == 5);
        assert_eq!(&*recording.reads.lock().unwrap(), b"early");

        channel.close();
        accept.join().unwrap();
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn peer_eof_closes_the_channel() {
        let (listener, addr) = echo_listener();
        let accept = thread::spawn(move || {
            let (peer, _) = listener.accept().unwrap();
            drop(peer);
        });

        let reactor = Reactor::new().unwrap();
        reactor.start().unwrap();
        let recording = Arc::new(Recording::default());
        let channel = TcpChannel::new(
            &reactor,
            ChannelConfig::default(),
            RecordingHandler(recording.clone()),
        );
        channel.connect(addr, None).wait().unwrap();

        channel.close_future().wait().unwrap();
        assert!(!channel.is_open());
        // Clean end-of-stream is not an error.
        assert_eq!(recording.errors.load(Ordering::SeqCst), 0);
        assert_eq!(recording.inactive.load(Ordering::SeqCst), 1);

        accept.join().unwrap();
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn write_after_close_is_failed() {
        let reactor = Reactor::new().unwrap();
        reactor.start().unwrap();
        let channel = TcpChannel::new(
            &reactor,
            ChannelConfig::default(),
            RecordingHandler(Arc::new(Recording::default())),
        );
        channel.close().wait().unwrap();

        let outcome = channel.write_and_flush(b"late".to_vec()).wait();
        assert!(matches!(outcome, Err(Error::ChannelClosed)));
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn adoption_off_the_owning_loop_is_refused() {
        let (listener, addr) = echo_listener();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let reactor = Reactor::new().unwrap();
        reactor.start().unwrap();
        let handler: Arc<dyn ChannelHandler> =
            Arc::new(RecordingHandler(Arc::new(Recording::default())));

        // The test thread is not a loop thread, so adoption must refuse.
        let outcome = TcpChannel::adopt(&reactor, ChannelConfig::default(), handler, accepted);
        match outcome {
            Err(Error::AffinityMismatch { owner, executing }) => {
                assert_eq!(owner, reactor.id());
                assert_eq!(executing, None);
            }
            other => panic!("expected an affinity refusal, got {other:?}"),
        }

        drop(client);
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }
}
