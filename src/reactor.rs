//! The single-threaded event-loop executor.
//!
//! A [`Reactor`] owns one OS thread ("the loop thread") that interleaves
//! three duties: blocking in `mio::Poll` for I/O readiness, draining a
//! multi-producer task queue, and firing deadline-ordered scheduled tasks.
//! Everything registered on a reactor (sockets, the dispatcher pipe, the
//! wakeup handle) is only ever touched from that thread; other threads talk
//! to it exclusively through [`Reactor::execute`] and [`Reactor::schedule`].
//!
//! ```text
//!              execute() / schedule()           readiness
//!   any thread ──────────────┐              ┌── epoll/kqueue
//!                            ▼              ▼
//!                     ┌─────────────────────────┐
//!                     │ loop thread             │
//!                     │  1. fire due timers     │
//!                     │  2. run queued tasks    │
//!                     │  3. dispatch readiness  │
//!                     │  4. block in poll       │
//!                     └─────────────────────────┘
//! ```
//!
//! Shutdown is a one-way ladder: `NotStarted → Started → ShuttingDown →
//! Shutdown → Terminated`, driven by compare-and-swap so it can be requested
//! from any thread. The graceful variant honors a quiet period during which
//! freshly submitted work restarts the countdown.

use std::collections::BinaryHeap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use mio::{Events, Poll};

use crate::error::{Error, Result};
use crate::handle::HandleTable;
use crate::object_pool::ObjectPool;
use crate::poll::{PollHandle, WAKE_TOKEN};
use crate::promise::TerminationFuture;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) const EVENTS_CAPACITY: usize = 1024;
/// Default size of read buffers handed out by the per-reactor pool.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
const INITIAL_POOL_BUFFERS: usize = 16;

/// Upper bound on how long the poll may block even when nothing is pending,
/// so state changes made without a wakeup are still noticed.
const MAX_BREAKOUT: Duration = Duration::from_secs(1);
/// Recheck cadence while winding down gracefully.
const SHUTDOWN_RECHECK: Duration = Duration::from_millis(100);
/// Budget for one task-queue drain before readiness gets a turn again.
const TASK_SLICE: Duration = Duration::from_millis(50);
/// The clock is consulted every this many tasks, not after each one.
const TASK_CHECK_INTERVAL: usize = 64;

mod state {
    pub const NOT_STARTED: u8 = 1;
    pub const STARTED: u8 = 2;
    pub const SHUTTING_DOWN: u8 = 3;
    pub const SHUTDOWN: u8 = 4;
    pub const TERMINATED: u8 = 5;

    pub fn name(value: u8) -> &'static str {
        match value {
            NOT_STARTED => "not started",
            STARTED => "started",
            SHUTTING_DOWN => "shutting down",
            SHUTDOWN => "shut down",
            _ => "terminated",
        }
    }
}

static NEXT_REACTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_LOOP: std::cell::Cell<Option<u64>> =
        const { std::cell::Cell::new(None) };
}

/// Id of the reactor whose loop thread is executing, if the current thread
/// is a loop thread at all.
pub(crate) fn current_loop_id() -> Option<u64> {
    CURRENT_LOOP.get()
}

/// Cancellation handle for a scheduled task. Cancelling is effective until
/// the reactor drains the task into its run queue.
#[derive(Clone)]
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct ScheduledTask {
    deadline: Instant,
    seq: u64,
    task: Option<Task>,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

struct ShutdownParams {
    quiet_period: Duration,
    timeout: Duration,
    started_at: Option<Instant>,
}

pub(crate) struct Shared {
    id: u64,
    state: AtomicU8,
    tasks: SegQueue<Task>,
    scheduled: Mutex<BinaryHeap<ScheduledTask>>,
    sched_seq: AtomicU64,
    poll_handle: PollHandle,
    // Consumed exactly once by the thread that wins the start CAS.
    poll: Mutex<Option<Poll>>,
    table: HandleTable,
    buffer_pool: ObjectPool<Vec<u8>>,
    loop_thread: OnceLock<ThreadId>,
    epoch: Instant,
    /// Nanoseconds since `epoch` at which the loop last ran application work.
    last_activity: AtomicU64,
    shutdown: Mutex<ShutdownParams>,
    termination: TerminationFuture,
}

/// Handle to a single-threaded event-loop executor. Cloning is cheap and all
/// clones drive the same loop.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.shared.id)
            .field("state", &state::name(self.shared.state()))
            .finish()
    }
}

impl Reactor {
    /// Creates a reactor with its own epoch. Reactors belonging to a pool
    /// share the pool's epoch instead; see [`crate::group::ReactorPool`].
    pub fn new() -> Result<Self> {
        Self::with_epoch(Instant::now())
    }

    pub(crate) fn with_epoch(epoch: Instant) -> Result<Self> {
        let poll = Poll::new().map_err(Error::from)?;
        let poll_handle = PollHandle::new(&poll).map_err(Error::from)?;
        let shared = Arc::new(Shared {
            id: NEXT_REACTOR_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(state::NOT_STARTED),
            tasks: SegQueue::new(),
            scheduled: Mutex::new(BinaryHeap::new()),
            sched_seq: AtomicU64::new(0),
            poll_handle,
            poll: Mutex::new(Some(poll)),
            table: HandleTable::default(),
            buffer_pool: ObjectPool::with_reset(
                INITIAL_POOL_BUFFERS,
                || vec![0u8; DEFAULT_BUFFER_SIZE],
                |buf| {
                    buf.clear();
                    buf.resize(DEFAULT_BUFFER_SIZE, 0);
                },
            ),
            loop_thread: OnceLock::new(),
            epoch,
            last_activity: AtomicU64::new(0),
            shutdown: Mutex::new(ShutdownParams {
                quiet_period: Duration::ZERO,
                timeout: Duration::ZERO,
                started_at: None,
            }),
            termination: TerminationFuture::new(),
        });
        Ok(Self { shared })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Spawns the loop thread. Idempotent while the reactor is running;
    /// rejected once shutdown has begun to complete.
    pub fn start(&self) -> Result<()> {
        match self.shared.state.compare_exchange(
            state::NOT_STARTED,
            state::STARTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(current) if current < state::SHUTDOWN => return Ok(()),
            Err(current) => return Err(Error::Rejected(state::name(current))),
        }

        let shared = Arc::clone(&self.shared);
        let poll = shared
            .poll
            .lock()
            .unwrap()
            .take()
            .expect("poll consumed exactly once by the winning start");
        thread::Builder::new()
            .name(format!("strand-loop-{}", self.shared.id))
            .spawn(move || {
                let _ = shared.loop_thread.set(thread::current().id());
                CURRENT_LOOP.set(Some(shared.id));
                Shared::run_loop(shared, poll);
            })
            .map_err(Error::from)?;
        Ok(())
    }

    /// True when called from this reactor's loop thread.
    pub fn in_event_loop(&self) -> bool {
        self.shared.in_event_loop()
    }

    /// Enqueues `task` onto the loop. Tasks submitted by one thread run in
    /// submission order relative to each other, interleaved with readiness
    /// callbacks. Fails with [`Error::Rejected`] once the reactor has shut
    /// down.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let current = self.shared.state();
        if current >= state::SHUTDOWN {
            return Err(Error::Rejected(state::name(current)));
        }
        if current == state::NOT_STARTED {
            self.start()?;
        }
        self.shared.tasks.push(Box::new(task));
        // From a foreign thread the enqueued task must not wait out the
        // current poll; the loop thread will see it before blocking again.
        if !self.in_event_loop() {
            self.shared.poll_handle.wake();
        }
        Ok(())
    }

    /// Runs `task` after `delay` on the loop thread, unless cancelled or the
    /// reactor begins shutting down first.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<ScheduledHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let current = self.shared.state();
        if current >= state::SHUTDOWN {
            return Err(Error::Rejected(state::name(current)));
        }
        if current == state::NOT_STARTED {
            self.start()?;
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut heap = self.shared.scheduled.lock().unwrap();
            heap.push(ScheduledTask {
                deadline: Instant::now() + delay,
                seq: self.shared.sched_seq.fetch_add(1, Ordering::Relaxed),
                task: Some(Box::new(task)),
                cancelled: Arc::clone(&cancelled),
            });
        }
        if !self.in_event_loop() {
            self.shared.poll_handle.wake();
        }
        Ok(ScheduledHandle { cancelled })
    }

    /// Begins the multi-phase shutdown. New tasks submitted during the quiet
    /// period reset the countdown; `timeout` caps the whole wind-down. The
    /// returned future resolves when the loop reaches its terminal state and
    /// carries the cause if the loop died abnormally.
    pub fn shutdown_gracefully(
        &self,
        quiet_period: Duration,
        timeout: Duration,
    ) -> TerminationFuture {
        loop {
            let current = self.shared.state();
            if current >= state::SHUTTING_DOWN {
                return self.termination_future();
            }
            if current == state::NOT_STARTED {
                // The loop thread has to exist for the wind-down to run.
                let _ = self.start();
                continue;
            }
            if self
                .shared
                .state
                .compare_exchange(
                    current,
                    state::SHUTTING_DOWN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                {
                    let mut params = self.shared.shutdown.lock().unwrap();
                    params.quiet_period = quiet_period;
                    params.timeout = timeout.max(quiet_period);
                    params.started_at = Some(Instant::now());
                }
                // The quiet-period countdown starts at the request.
                self.shared.touch();
                self.shared.poll_handle.wake();
                return self.termination_future();
            }
        }
    }

    pub fn termination_future(&self) -> TerminationFuture {
        self.shared.termination.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.state() >= state::SHUTTING_DOWN
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.state() >= state::TERMINATED
    }

    /// Instant the process bootstrap captured when this reactor (or its
    /// pool) was created. Monotonic reference point for loop timestamps.
    pub fn epoch(&self) -> Instant {
        self.shared.epoch
    }

    /// Handles currently holding this loop open. Internal handles (waker,
    /// dispatcher pipe endpoints) are not counted.
    pub fn active_handles(&self) -> usize {
        self.shared.table.active_count()
    }

    pub(crate) fn poll_handle(&self) -> &PollHandle {
        &self.shared.poll_handle
    }

    pub(crate) fn table(&self) -> &HandleTable {
        &self.shared.table
    }

    pub(crate) fn buffer_pool(&self) -> &ObjectPool<Vec<u8>> {
        &self.shared.buffer_pool
    }
}

impl Shared {
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    // States only ever move forward.
    fn advance_state(&self, target: u8) {
        let mut current = self.state();
        while current < target {
            match self.state.compare_exchange(
                current,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn in_event_loop(&self) -> bool {
        self.loop_thread.get() == Some(&thread::current().id())
    }

    fn touch(&self) {
        let nanos = Instant::now().duration_since(self.epoch).as_nanos() as u64;
        self.last_activity.store(nanos, Ordering::Release);
    }

    fn last_activity_instant(&self) -> Instant {
        self.epoch + Duration::from_nanos(self.last_activity.load(Ordering::Acquire))
    }

    fn run_loop(shared: Arc<Shared>, mut poll: Poll) {
        let result = Self::loop_body(&shared, &mut poll);
        shared.advance_state(state::SHUTDOWN);

        // Terminal teardown, performed exactly once: no further wakeups, the
        // queue gets a final drain, and every pinned owner is released.
        shared.poll_handle.disarm_wake();
        shared.cancel_scheduled();
        shared.run_all_tasks();
        for sink in shared.table.drain() {
            let guarded = catch_unwind(AssertUnwindSafe(|| sink.close_completed()));
            if guarded.is_err() {
                log::error!("owner panicked during loop {} teardown", shared.id);
            }
        }
        drop(poll);
        shared.advance_state(state::TERMINATED);

        match result {
            Ok(()) => {
                log::debug!("event loop {} terminated", shared.id);
                shared.termination.try_succeed(());
            }
            Err(err) => {
                log::error!("event loop {} terminated abnormally: {err}", shared.id);
                shared
                    .termination
                    .try_fail(Error::LoopTerminated(err.to_string()));
            }
        }
    }

    fn loop_body(shared: &Arc<Shared>, poll: &mut Poll) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            let timeout = shared.next_poll_timeout();
            match PollHandle::poll(poll, &mut events, Some(timeout)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // An error escaping the poll itself is fatal for this
                // reactor only; the termination future carries it.
                Err(err) => return Err(err),
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let Some(sink) = shared.table.get(event.token()) else {
                    continue;
                };
                let readable = event.is_readable() || event.is_read_closed();
                let writable = event.is_writable() || event.is_write_closed();
                let outcome =
                    catch_unwind(AssertUnwindSafe(|| sink.on_ready(readable, writable)));
                if outcome.is_err() {
                    log::error!(
                        "handler panicked on loop {} (token {})",
                        shared.id,
                        event.token().0
                    );
                }
            }

            shared.drain_due_scheduled();
            shared.run_tasks(TASK_SLICE);

            if shared.state() >= state::SHUTTING_DOWN && shared.confirm_shutdown() {
                return Ok(());
            }
        }
    }

    /// Smallest of: the fixed breakout interval, the gap to the next
    /// scheduled deadline, zero when tasks are already waiting.
    fn next_poll_timeout(&self) -> Duration {
        if !self.tasks.is_empty() {
            return Duration::ZERO;
        }
        let mut timeout = MAX_BREAKOUT;
        if let Some(deadline) = self.next_deadline() {
            timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
        }
        if self.state() >= state::SHUTTING_DOWN {
            timeout = timeout.min(SHUTDOWN_RECHECK);
        }
        timeout
    }

    fn next_deadline(&self) -> Option<Instant> {
        let heap = self.scheduled.lock().unwrap();
        heap.peek().map(|t| t.deadline)
    }

    fn drain_due_scheduled(&self) {
        let now = Instant::now();
        let mut heap = self.scheduled.lock().unwrap();
        while let Some(top) = heap.peek() {
            if top.cancelled.load(Ordering::Acquire) {
                heap.pop();
                continue;
            }
            if top.deadline > now {
                break;
            }
            let mut due = heap.pop().unwrap();
            if let Some(task) = due.task.take() {
                self.tasks.push(task);
            }
        }
    }

    fn cancel_scheduled(&self) {
        let mut heap = self.scheduled.lock().unwrap();
        for entry in heap.drain() {
            entry.cancelled.store(true, Ordering::Release);
        }
    }

    /// Runs queued tasks up to a bounded time slice. The clock is checked
    /// every [`TASK_CHECK_INTERVAL`] tasks to keep the bound cheap.
    fn run_tasks(&self, slice: Duration) -> usize {
        let started = Instant::now();
        let mut ran = 0usize;
        while let Some(task) = self.tasks.pop() {
            Self::run_task(task, self.id);
            ran += 1;
            if ran % TASK_CHECK_INTERVAL == 0 && started.elapsed() >= slice {
                break;
            }
        }
        if ran > 0 {
            self.touch();
        }
        ran
    }

    fn run_all_tasks(&self) -> usize {
        let mut ran = 0usize;
        while let Some(task) = self.tasks.pop() {
            Self::run_task(task, self.id);
            ran += 1;
        }
        if ran > 0 {
            self.touch();
        }
        ran
    }

    // A panicking task must not take the loop thread down with it.
    fn run_task(task: Task, loop_id: u64) {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            log::error!("task panicked on loop {loop_id}; loop continues");
        }
    }

    /// One wind-down round. Returns `true` once the loop may stop: the queue
    /// stayed empty for the whole quiet period, or the overall timeout
    /// elapsed. Freshly arrived tasks restart the countdown.
    fn confirm_shutdown(&self) -> bool {
        self.cancel_scheduled();
        let (quiet_period, timeout, started_at) = {
            let params = self.shutdown.lock().unwrap();
            match params.started_at {
                Some(at) => (params.quiet_period, params.timeout, at),
                None => return true,
            }
        };

        if self.run_all_tasks() > 0 {
            if quiet_period.is_zero() {
                return true;
            }
            return false;
        }

        let now = Instant::now();
        if quiet_period.is_zero() {
            return true;
        }
        if now.duration_since(started_at) >= timeout {
            return true;
        }
        now.duration_since(self.last_activity_instant()) >= quiet_period
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn started_reactor() -> Reactor {
        let reactor = Reactor::new().unwrap();
        reactor.start().unwrap();
        reactor
    }

    #[test]
    fn tasks_run_on_the_loop_thread() {
        let reactor = started_reactor();
        let observed = Arc::new(StdMutex::new(None));
        let slot = observed.clone();
        let handle = reactor.clone();
        reactor
            .execute(move || {
                *slot.lock().unwrap() = Some(handle.in_event_loop());
            })
            .unwrap();

        wait_until(|| observed.lock().unwrap().is_some());
        assert_eq!(*observed.lock().unwrap(), Some(true));
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn concurrent_submissions_each_run_exactly_once() {
        let reactor = started_reactor();
        let counter = Arc::new(AtomicUsize::new(0));
        let off_loop = Arc::new(AtomicUsize::new(0));

        let mut joins = Vec::new();
        for _ in 0..8 {
            let reactor = reactor.clone();
            let counter = counter.clone();
            let off_loop = off_loop.clone();
            joins.push(thread::spawn(move || {
                for _ in 0..125 {
                    let counter = counter.clone();
                    let off_loop = off_loop.clone();
                    let handle = reactor.clone();
                    reactor
                        .execute(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                            if !handle.in_event_loop() {
                                off_loop.fetch_add(1, Ordering::SeqCst);
                            }
                        })
                        .unwrap();
                }
            }));
        }
        for join in joins {
            join.join().unwrap();
        }

        wait_until(|| counter.load(Ordering::SeqCst) == 1000);
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
        assert_eq!(off_loop.load(Ordering::SeqCst), 0);
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn scheduled_tasks_fire_in_deadline_order() {
        let reactor = started_reactor();
        let order = Arc::new(StdMutex::new(Vec::new()));

        for (delay_ms, tag) in [(90u64, 3u32), (30, 1), (60, 2)] {
            let order = order.clone();
            reactor
                .schedule(Duration::from_millis(delay_ms), move || {
                    order.lock().unwrap().push(tag);
                })
                .unwrap();
        }

        wait_until(|| order.lock().unwrap().len() == 3);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn cancelled_tasks_never_run() {
        let reactor = started_reactor();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = reactor
            .schedule(Duration::from_millis(80), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        handle.cancel();

        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn shutdown_is_monotonic_and_rejects_new_work() {
        let reactor = started_reactor();
        let future = reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
        future.wait().unwrap();
        assert!(reactor.is_terminated());

        let denied = reactor.execute(|| {});
        assert!(matches!(denied, Err(Error::Rejected(_))));
        let denied = reactor.schedule(Duration::from_millis(1), || {});
        assert!(matches!(denied, Err(Error::Rejected(_))));

        // A repeated request observes the same terminal future.
        let again = reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
        assert!(again.is_done());
    }

    #[test]
    fn quiet_period_delays_the_stop() {
        let reactor = started_reactor();
        let quiet = Duration::from_millis(300);
        let begun = Instant::now();
        let future = reactor.shutdown_gracefully(quiet, Duration::from_secs(5));
        future.wait().unwrap();
        let elapsed = begun.elapsed();
        assert!(elapsed >= quiet, "stopped early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "stopped late: {elapsed:?}");
    }

    #[test]
    fn shutdown_cancels_pending_scheduled_tasks() {
        let reactor = started_reactor();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = reactor
            .schedule(Duration::from_secs(30), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        reactor
            .shutdown_gracefully(Duration::ZERO, Duration::ZERO)
            .wait()
            .unwrap();
        assert!(handle.is_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn a_panicking_task_does_not_kill_the_loop() {
        let reactor = started_reactor();
        reactor.execute(|| panic!("boom")).unwrap();

        let survived = Arc::new(AtomicUsize::new(0));
        let counter = survived.clone();
        reactor
            .execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        wait_until(|| survived.load(Ordering::SeqCst) == 1);
        reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
    }

    #[test]
    fn shutdown_from_not_started_still_terminates() {
        let reactor = Reactor::new().unwrap();
        let future = reactor.shutdown_gracefully(Duration::ZERO, Duration::ZERO);
        assert!(future.wait_timeout(Duration::from_secs(5)).is_some());
        assert!(reactor.is_terminated());
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }
}
