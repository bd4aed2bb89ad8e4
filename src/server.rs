//! Accepting server: one dispatcher loop accepting connections and a pool
//! of worker loops adopting them.
//!
//! The dispatcher never reads or writes client sockets. It accepts, picks a
//! worker round-robin, and passes the descriptor over a local Unix socket
//! with an `SCM_RIGHTS` control message. Each worker keeps one inlet
//! connection to that pipe registered in its own loop; when the inlet turns
//! readable the worker receives the descriptors and adopts each one as a
//! [`TcpChannel`] on its own thread. A socket is therefore only ever driven
//! by the loop that owns it, without any cross-thread registration.

use std::collections::VecDeque;
use std::io;
use std::io::{IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Interest, Token};
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags,
};

use crate::channel::TcpChannel;
use crate::config::{ChannelConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::group::ReactorPool;
use crate::handle::EventSink;
use crate::handler::ChannelHandler;
use crate::promise::Promise;
use crate::reactor::Reactor;

/// A TCP server whose accepted connections are spread across a worker pool.
pub struct TcpServer {
    dispatcher: Reactor,
    workers: ReactorPool,
    core: Arc<DispatcherCore>,
    inlets: Vec<Arc<WorkerInlet>>,
    local_addr: SocketAddr,
    pipe_path: PathBuf,
}

impl TcpServer {
    /// Binds the listener, starts the dispatcher and worker loops, and wires
    /// every worker to the handoff pipe. Returns once the server accepts
    /// traffic.
    pub fn bind<H>(config: ServerConfig, handler: H) -> Result<TcpServer>
    where
        H: ChannelHandler,
    {
        let handler: Arc<dyn ChannelHandler> = Arc::new(handler);
        let gate = config
            .max_connections
            .map(|limit| Arc::new(ConnectionGate::new(limit)));
        let adopt_handler: Arc<dyn ChannelHandler> = match &gate {
            Some(gate) => Arc::new(GatedHandler {
                inner: handler,
                gate: gate.clone(),
            }),
            None => handler,
        };

        let workers = ReactorPool::new(config.workers.max(1))?;
        let dispatcher = Reactor::new()?;
        dispatcher.start()?;

        let pipe_path = handoff_pipe_path();
        let core = Arc::new(DispatcherCore {
            gate,
            accepted: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            state: Mutex::new(DispatcherState::default()),
        });

        let local_addr = install_dispatcher(&dispatcher, &core, &config, &pipe_path)?;

        let mut inlets = Vec::with_capacity(workers.len());
        for worker in workers.reactors() {
            let inlet = WorkerInlet::install(
                worker,
                &pipe_path,
                &config,
                config.channel.clone(),
                adopt_handler.clone(),
                core.gate.clone(),
            )?;
            inlets.push(inlet);
        }

        log::info!(
            "server listening on {local_addr} with {} worker loops",
            workers.len()
        );
        Ok(TcpServer {
            dispatcher,
            workers,
            core,
            inlets,
            local_addr,
            pipe_path,
        })
    }

    /// The address the listener actually bound, with any ephemeral port
    /// resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dispatcher(&self) -> &Reactor {
        &self.dispatcher
    }

    pub fn workers(&self) -> &ReactorPool {
        &self.workers
    }

    /// Connections accepted so far, whether or not they got dispatched.
    pub fn accepted(&self) -> u64 {
        self.core.accepted.load(Ordering::Relaxed)
    }

    /// Connections handed to a worker so far.
    pub fn dispatched(&self) -> u64 {
        self.core.dispatched.load(Ordering::Relaxed)
    }

    /// Stops accepting first, then winds the workers down. In-flight
    /// channels get the quiet period to finish.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> bool {
        let dispatcher_done = self
            .dispatcher
            .shutdown_gracefully(quiet_period, timeout)
            .wait()
            .is_ok();
        let workers_done = self.workers.shutdown_and_wait(quiet_period, timeout);
        let _ = std::fs::remove_file(&self.pipe_path);
        dispatcher_done && workers_done
    }

    /// Closes the listener without disturbing connections that were already
    /// handed to a worker. The returned future resolves once the dispatcher
    /// has dropped the listening socket.
    pub fn stop_accepting(&self) -> Promise<()> {
        let done: Promise<()> = Promise::new();
        let core = self.core.clone();
        let reactor = self.dispatcher.clone();
        let resolved = done.clone();
        let submitted = self.dispatcher.execute(move || {
            core.close_listener(&reactor);
            resolved.try_succeed(());
        });
        if let Err(err) = submitted {
            done.try_fail(err);
        }
        done
    }

    /// Connections adopted so far, per worker loop, in pool order.
    pub fn adopted_per_worker(&self) -> Vec<u64> {
        self.inlets
            .iter()
            .map(|inlet| inlet.adopted.load(Ordering::Relaxed))
            .collect()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if !self.dispatcher.is_terminated() {
            self.dispatcher
                .shutdown_gracefully(Duration::ZERO, Duration::ZERO);
        }
        let _ = std::fs::remove_file(&self.pipe_path);
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.local_addr)
            .field("workers", &self.workers.len())
            .finish()
    }
}

fn handoff_pipe_path() -> PathBuf {
    std::env::temp_dir().join(format!(
        "strand-{}-{:016x}.sock",
        std::process::id(),
        rand::random::<u64>()
    ))
}

/// Binds both listeners on the dispatcher's loop thread and reports back the
/// bound TCP address.
fn install_dispatcher(
    dispatcher: &Reactor,
    core: &Arc<DispatcherCore>,
    config: &ServerConfig,
    pipe_path: &Path,
) -> Result<SocketAddr> {
    let ready: Promise<SocketAddr> = Promise::new();
    {
        let ready = ready.clone();
        let core = core.clone();
        let reactor = dispatcher.clone();
        let address = config.address;
        let pipe_path = pipe_path.to_path_buf();
        dispatcher.execute(move || {
            let bound = bind_dispatcher(&reactor, &core, address, &pipe_path);
            match bound {
                Ok(addr) => {
                    ready.try_succeed(addr);
                }
                Err(err) => {
                    ready.try_fail(err);
                }
            }
        })?;
    }
    ready
        .wait_timeout(config.startup_timeout)
        .ok_or_else(|| Error::Handoff("dispatcher startup timed out".into()))?
}

fn bind_dispatcher(
    reactor: &Reactor,
    core: &Arc<DispatcherCore>,
    address: SocketAddr,
    pipe_path: &Path,
) -> Result<SocketAddr> {
    let mut pipe = UnixListener::bind(pipe_path)?;
    let mut listener = TcpListener::bind(address)?;
    let local_addr = listener.local_addr()?;

    // The pipe listener is internal plumbing and does not hold the loop open.
    let pipe_token = reactor.table().next_token();
    reactor.table().pin(
        pipe_token,
        Arc::new(PipeSink {
            core: core.clone(),
        }),
        false,
    );
    if let Err(err) = reactor
        .poll_handle()
        .register(&mut pipe, pipe_token, Interest::READABLE)
    {
        reactor.table().unpin(pipe_token);
        return Err(err);
    }

    let accept_token = reactor.table().next_token();
    reactor.table().pin(
        accept_token,
        Arc::new(AcceptSink {
            core: core.clone(),
        }),
        true,
    );
    if let Err(err) = reactor
        .poll_handle()
        .register(&mut listener, accept_token, Interest::READABLE)
    {
        reactor.table().unpin(accept_token);
        reactor.table().unpin(pipe_token);
        return Err(err);
    }

    let mut state = core.state.lock().unwrap();
    state.pipe = Some(pipe);
    state.listener = Some(listener);
    state.accept_token = Some(accept_token);
    Ok(local_addr)
}

struct DispatcherCore {
    gate: Option<Arc<ConnectionGate>>,
    accepted: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    state: Mutex<DispatcherState>,
}

#[derive(Default)]
struct DispatcherState {
    listener: Option<TcpListener>,
    accept_token: Option<Token>,
    pipe: Option<UnixListener>,
    inlets: Vec<UnixStream>,
    next_inlet: usize,
    // Accepts that arrived before any worker finished wiring its inlet.
    backlog: VecDeque<TcpStream>,
}

impl DispatcherCore {
    fn accept_burst(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            let accepted = match state.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    if let Some(gate) = &self.gate {
                        if !gate.try_acquire() {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            log::warn!("connection limit reached, dropping {peer}");
                            drop(stream);
                            continue;
                        }
                    }
                    self.dispatch(&mut state, stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!("accept failed: {err}");
                    break;
                }
            }
        }
    }

    fn accept_inlets(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            let accepted = match state.pipe.as_ref() {
                Some(pipe) => pipe.accept(),
                None => return,
            };
            match accepted {
                Ok((inlet, _)) => {
                    log::debug!("worker inlet {} connected", state.inlets.len());
                    state.inlets.push(inlet);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!("handoff pipe accept failed: {err}");
                    break;
                }
            }
        }
        while let Some(stream) = state.backlog.pop_front() {
            if state.inlets.is_empty() {
                state.backlog.push_front(stream);
                break;
            }
            self.dispatch(&mut state, stream);
        }
    }

    /// Hands `stream` to the next worker inlet. The kernel duplicates the
    /// descriptor into the message, so the local copy drops right after.
    fn dispatch(&self, state: &mut DispatcherState, stream: TcpStream) {
        if state.inlets.is_empty() {
            state.backlog.push_back(stream);
            return;
        }
        let mut attempts = state.inlets.len();
        while attempts > 0 {
            let index = state.next_inlet % state.inlets.len();
            state.next_inlet = state.next_inlet.wrapping_add(1);
            match send_descriptor(state.inlets[index].as_raw_fd(), stream.as_raw_fd()) {
                Ok(()) => {
                    self.dispatched.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(err) => {
                    log::warn!("worker inlet {index} rejected a handoff: {err}");
                    state.inlets.remove(index);
                    attempts = state.inlets.len();
                }
            }
        }
        self.dropped.fetch_add(1, Ordering::Relaxed);
        if let Some(gate) = &self.gate {
            gate.release();
        }
        log::error!("no worker inlets available, dropping connection");
    }

    /// Closes just the TCP listener. Adopted channels and the handoff pipe
    /// are untouched; anything still in the backlog drains normally.
    fn close_listener(&self, reactor: &Reactor) {
        let mut state = self.state.lock().unwrap();
        let Some(mut listener) = state.listener.take() else {
            return;
        };
        if let Err(err) = reactor.poll_handle().deregister(&mut listener) {
            log::warn!("listener deregister failed: {err}");
        }
        if let Some(token) = state.accept_token.take() {
            reactor.table().unpin(token);
        }
    }

    fn teardown(&self) {
        let mut state = self.state.lock().unwrap();
        state.listener = None;
        state.accept_token = None;
        state.pipe = None;
        state.inlets.clear();
        state.backlog.clear();
    }
}

/// Dispatcher-side sink for the TCP listener.
struct AcceptSink {
    core: Arc<DispatcherCore>,
}

impl EventSink for AcceptSink {
    fn on_ready(&self, readable: bool, _writable: bool) {
        if readable {
            self.core.accept_burst();
        }
    }

    fn close_completed(&self) {
        self.core.teardown();
    }
}

/// Dispatcher-side sink for the handoff pipe listener.
struct PipeSink {
    core: Arc<DispatcherCore>,
}

impl EventSink for PipeSink {
    fn on_ready(&self, readable: bool, _writable: bool) {
        if readable {
            self.core.accept_inlets();
        }
    }

    fn close_completed(&self) {
        self.core.teardown();
    }
}

fn send_descriptor(inlet_fd: RawFd, payload_fd: RawFd) -> nix::Result<()> {
    let fds = [payload_fd];
    let iov = [IoSlice::new(&[1u8])];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(inlet_fd, &iov, &cmsg, MsgFlags::empty(), None).map(|_| ())
}

/// Worker-side end of the handoff pipe. Lives as a pinned handle in the
/// worker's table for the lifetime of the server.
struct WorkerInlet {
    reactor: Reactor,
    stream: Mutex<Option<UnixStream>>,
    config: ChannelConfig,
    handler: Arc<dyn ChannelHandler>,
    gate: Option<Arc<ConnectionGate>>,
    adopted: AtomicU64,
}

impl WorkerInlet {
    /// Connects this worker to the dispatcher's pipe and registers the inlet
    /// in the worker's own loop. Blocks the caller until the wiring is done.
    fn install(
        worker: &Reactor,
        pipe_path: &Path,
        server_config: &ServerConfig,
        channel_config: ChannelConfig,
        handler: Arc<dyn ChannelHandler>,
        gate: Option<Arc<ConnectionGate>>,
    ) -> Result<Arc<WorkerInlet>> {
        let inlet = Arc::new(WorkerInlet {
            reactor: worker.clone(),
            stream: Mutex::new(None),
            config: channel_config,
            handler,
            gate,
            adopted: AtomicU64::new(0),
        });

        let ready: Promise<()> = Promise::new();
        {
            let ready = ready.clone();
            let inlet = inlet.clone();
            let pipe_path = pipe_path.to_path_buf();
            let attempts = server_config.pipe_connect_attempts.max(1);
            let delay = server_config.pipe_connect_delay;
            worker.execute(move || {
                match inlet.connect_pipe(&pipe_path, attempts, delay) {
                    Ok(()) => {
                        ready.try_succeed(());
                    }
                    Err(err) => {
                        ready.try_fail(err);
                    }
                }
            })?;
        }
        ready
            .wait_timeout(server_config.startup_timeout)
            .ok_or_else(|| Error::Handoff("worker inlet wiring timed out".into()))??;
        Ok(inlet)
    }

    fn connect_pipe(
        self: &Arc<Self>,
        pipe_path: &Path,
        attempts: u32,
        delay: Duration,
    ) -> Result<()> {
        let mut last_err: Option<io::Error> = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                std::thread::sleep(delay);
            }
            match std::os::unix::net::UnixStream::connect(pipe_path) {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    let mut stream = UnixStream::from_std(stream);
                    let token = self.reactor.table().next_token();
                    self.reactor
                        .table()
                        .pin(token, self.clone() as Arc<dyn EventSink>, false);
                    if let Err(err) =
                        self.reactor
                            .poll_handle()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        self.reactor.table().unpin(token);
                        return Err(err);
                    }
                    *self.stream.lock().unwrap() = Some(stream);
                    return Ok(());
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(Error::Handoff(format!(
            "could not reach handoff pipe after {attempts} attempts: {}",
            last_err.map_or_else(|| "no attempt made".into(), |e| e.to_string())
        )))
    }

    /// Drains every descriptor currently queued on the inlet and adopts each
    /// one as a channel on this worker.
    fn receive_burst(&self) {
        loop {
            let received = {
                let guard = self.stream.lock().unwrap();
                let Some(stream) = guard.as_ref() else { return };
                receive_descriptor(stream.as_raw_fd())
            };
            match received {
                Ok(Some(fd)) => self.adopt_descriptor(fd),
                // The dispatcher end closed; the server is going away.
                Ok(None) => {
                    *self.stream.lock().unwrap() = None;
                    return;
                }
                Err(nix::errno::Errno::EAGAIN) => return,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    log::error!("handoff receive failed: {err}");
                    *self.stream.lock().unwrap() = None;
                    return;
                }
            }
        }
    }

    fn adopt_descriptor(&self, fd: OwnedFd) {
        // A handed-off socket with reads disabled can never make progress on
        // this loop; close it right away instead of parking it open.
        if !self.config.auto_read {
            log::warn!("auto-read disabled, closing handed-off connection");
            drop(fd);
            if let Some(gate) = &self.gate {
                gate.release();
            }
            return;
        }
        let stream = std::net::TcpStream::from(fd);
        match TcpChannel::adopt(
            &self.reactor,
            self.config.clone(),
            self.handler.clone(),
            stream,
        ) {
            Ok(channel) => {
                self.adopted.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "loop {} adopted connection from {:?}",
                    self.reactor.id(),
                    channel.remote_addr()
                );
            }
            Err(err) => {
                log::error!("failed to adopt handed-off connection: {err}");
                if let Some(gate) = &self.gate {
                    gate.release();
                }
            }
        }
    }
}

impl EventSink for WorkerInlet {
    fn on_ready(&self, readable: bool, _writable: bool) {
        if readable {
            self.receive_burst();
        }
    }

    fn close_completed(&self) {
        *self.stream.lock().unwrap() = None;
    }
}

/// Receives one descriptor from the pipe. `Ok(None)` means the peer closed.
fn receive_descriptor(inlet_fd: RawFd) -> nix::Result<Option<OwnedFd>> {
    let mut byte = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut byte)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(
        inlet_fd,
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;
    if msg.bytes == 0 {
        return Ok(None);
    }
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                // recvmsg installed the descriptor; take ownership of it.
                return Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }
    }
    Err(nix::errno::Errno::EBADMSG)
}

/// Caps concurrent adopted connections when the server configures a limit.
struct ConnectionGate {
    limit: usize,
    current: AtomicUsize,
}

impl ConnectionGate {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            current: AtomicUsize::new(0),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self) {
        let previous = self.current.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }
}

/// Releases the connection gate once the adopted channel goes inactive.
struct GatedHandler {
    inner: Arc<dyn ChannelHandler>,
    gate: Arc<ConnectionGate>,
}

impl ChannelHandler for GatedHandler {
    fn on_active(&self, channel: &TcpChannel) {
        self.inner.on_active(channel);
    }

    fn on_read(&self, channel: &TcpChannel, data: &[u8]) {
        self.inner.on_read(channel, data);
    }

    fn on_read_complete(&self, channel: &TcpChannel) {
        self.inner.on_read_complete(channel);
    }

    fn on_inactive(&self, channel: &TcpChannel) {
        self.inner.on_inactive(channel);
        self.gate.release();
    }

    fn on_exception(&self, channel: &TcpChannel, error: Error) {
        self.inner.on_exception(channel, error);
    }
}
