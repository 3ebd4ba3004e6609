//! The reactor: a cooperative single-thread scheduler for all core state.
//!
//! Every mutation of cells, config tree and channel registry happens on one
//! logical thread — the thread running [`Reactor::run`] (or, in test and
//! synchronous modes, [`Reactor::flush`]). Everything else in the process is
//! a plain OS thread producing closures: device I/O callbacks, the protocol
//! server and the canary marshal their work in through [`Reactor::post_now`]
//! or [`Reactor::schedule`], which are safe from any thread. That is the
//! entire synchronization discipline; the reactor protects its own mailbox,
//! timer heap and task map internally.
//!
//! Scheduling is *keyed*: at most one task is pending per key. A request
//! with a strictly earlier due time advances the pending task (and replaces
//! its closure); a later or equal request is dropped, unless it carries loop
//! settings, which cancel-and-replace; a request with no due time at all
//! cancels the key. A `min_spacing` bound pushes the computed due time
//! forward so two runs of the same key keep a minimum distance.
//!
//! Periodic tasks align to a fixed wall-clock grid:
//! `next = last_due + period - (last_due mod period)`. The wall clock is
//! used deliberately — a backward clock adjustment shifts the grid, exactly
//! as in the systems this framework is built to replace, and no
//! monotonic-clock correction is applied. When a run starts within
//! `skip_fraction * period` of its next slot the loop skips one extra
//! period and fires the skip callback once, signalling overload.
//!
//! Ordering guarantees: mailbox items preserve submission order; timer items
//! execute in non-decreasing due-time order. The interleaving between a
//! mailbox item and a timer item due at essentially the same instant is
//! explicitly *not* guaranteed (the loop happens to poll the mailbox first;
//! do not rely on it).
//!
//! A task that panics is not swallowed: the panic propagates out of
//! `run()`/`flush()` to the caller. Crash-and-restart under process
//! supervision is the expected operator response.

mod canary;
mod task;

pub use canary::Canary;
pub use task::{Job, Schedule, SkipCallback};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

use task::{LoopSpec, Task, TimerState};

/// Current wall-clock time in seconds since the Unix epoch.
///
/// All reactor due-time arithmetic is wall-clock based; the periodic grid is
/// a property of the clock, not of process start.
pub fn wall_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

enum Envelope {
    Run(Job),
    Wake,
    Stop,
}

struct Shared {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    timers: Mutex<TimerState>,
    exec: Mutex<()>,
    executed: AtomicU64,
    reactor_thread: Mutex<Option<ThreadId>>,
    max_poll: Duration,
}

/// Cloneable handle to the scheduler. All methods are callable from any
/// thread; only `run` and `flush` execute work, and they must be called
/// from a single thread at a time.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

/// Restores the recorded reactor thread when `run`/`flush` exits.
struct ThreadClaim<'a> {
    shared: &'a Shared,
    previous: Option<ThreadId>,
}

impl<'a> ThreadClaim<'a> {
    fn new(shared: &'a Shared) -> Self {
        let previous = shared
            .reactor_thread
            .lock()
            .replace(std::thread::current().id());
        Self { shared, previous }
    }
}

impl Drop for ThreadClaim<'_> {
    fn drop(&mut self) {
        *self.shared.reactor_thread.lock() = self.previous;
    }
}

/// Wall-clock bound for [`Reactor::flush`].
#[derive(Default, Clone, Copy)]
pub struct FlushBound {
    for_duration: Option<f64>,
    align_to: Option<f64>,
    until: Option<f64>,
}

impl FlushBound {
    /// Drain for `secs` seconds from now.
    pub fn for_duration(secs: f64) -> Self {
        Self {
            for_duration: Some(secs),
            ..Self::default()
        }
    }

    /// Drain until an absolute wall-clock time.
    pub fn until(when: f64) -> Self {
        Self {
            until: Some(when),
            ..Self::default()
        }
    }

    /// Round the deadline up to the next multiple of `grid` seconds, so the
    /// flush ends on a periodic grid boundary.
    pub fn align_to(mut self, grid: f64) -> Self {
        self.align_to = Some(grid);
        self
    }
}

impl Reactor {
    /// Create a reactor with the default maximum poll interval (1s).
    pub fn new() -> Self {
        Self::with_max_poll(Duration::from_secs(1))
    }

    /// Create a reactor with an explicit maximum poll interval — the ceiling
    /// on how long the loop blocks waiting for work.
    pub fn with_max_poll(max_poll: Duration) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                tx,
                rx,
                timers: Mutex::new(TimerState::default()),
                exec: Mutex::new(()),
                executed: AtomicU64::new(0),
                reactor_thread: Mutex::new(None),
                max_poll,
            }),
        }
    }

    /// Append `job` to the mailbox for execution as soon as possible. Wakes
    /// a blocked reactor. Callable from any thread; this is the only legal
    /// way for foreign-thread callbacks to touch reactor-owned state.
    pub fn post_now<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut job = Some(job);
        let _ = self.shared.tx.send(Envelope::Run(Box::new(move || {
            if let Some(job) = job.take() {
                job();
            }
        })));
    }

    /// Idempotent keyed scheduling; see the module docs for the semantics.
    /// An empty [`Schedule`] cancels any pending task for `key` (the job is
    /// then unused).
    pub fn schedule<F>(&self, key: &str, spec: Schedule, job: F)
    where
        F: FnMut() + Send + 'static,
    {
        let now = wall_now();
        {
            let mut state = self.shared.timers.lock();

            if !spec.has_due() {
                if state.tasks.remove(key).is_some() {
                    trace!(key, "cancelled pending task");
                }
                return;
            }

            let mut due = match (spec.at, spec.after, spec.period) {
                (Some(at), _, _) => at,
                (None, Some(after), _) => now + after,
                // Period only: first run lands on the next grid point.
                (None, None, Some(period)) => now + period - (now % period),
                (None, None, None) => return,
            };

            if let Some(spacing) = spec.min_spacing {
                if let Some(record) = state.history.get(key) {
                    let earliest = record.last_due + spacing;
                    if due < earliest {
                        due = earliest;
                    }
                }
            }

            let looping = spec.period.map(|period| LoopSpec {
                period,
                skip_fraction: spec.skip_fraction,
                skip_callback: spec.skip_callback,
            });

            match state.tasks.get(key) {
                Some(pending) if looping.is_none() && due >= pending.due => {
                    // Later or equal without loop settings: dropped.
                    trace!(key, due, pending = pending.due, "duplicate request ignored");
                    return;
                }
                Some(_) => {
                    // Strictly earlier, or loop settings supplied:
                    // cancel-and-replace (the stale heap entry is pruned
                    // lazily).
                    debug!(key, due, "rescheduling pending task");
                }
                None => {
                    trace!(key, due, "scheduling task");
                }
            }

            let seq = state.fresh_seq();
            state.insert(Task {
                key: key.to_owned(),
                job: Box::new(job),
                due,
                seq,
                has_run: false,
                looping,
            });
        }
        // Re-evaluate the wait deadline in case the new task is earlier
        // than what the loop is currently sleeping towards.
        let _ = self.shared.tx.send(Envelope::Wake);
    }

    /// Periodic variant: grid-aligned loop with overload skipping. A `None`
    /// period cancels the loop for `key`.
    pub fn schedule_periodic<F>(
        &self,
        key: &str,
        period: Option<f64>,
        skip_fraction: f64,
        skip_callback: Option<SkipCallback>,
        job: F,
    ) where
        F: FnMut() + Send + 'static,
    {
        let spec = match period {
            Some(period) => Schedule {
                period: Some(period),
                skip_fraction,
                skip_callback,
                ..Schedule::default()
            },
            None => Schedule::cancel(),
        };
        self.schedule(key, spec, job);
    }

    /// Blocking loop: executes mailbox and due timer items until [`stop`]
    /// (which drains remaining ready items first).
    ///
    /// [`stop`]: Reactor::stop
    pub fn run(&self) {
        let _claim = ThreadClaim::new(&self.shared);
        loop {
            match self.shared.rx.try_recv() {
                Ok(envelope) => {
                    if self.handle(envelope) {
                        return;
                    }
                    continue;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return,
            }

            if let Some(task) = self.pop_due() {
                self.dispatch(task);
                continue;
            }

            match self.shared.rx.recv_timeout(self.wait_duration(None)) {
                Ok(envelope) => {
                    if self.handle(envelope) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Wall-clock-bounded draining, for synchronous and test-mode execution
    /// in place of the blocking loop.
    pub fn flush(&self, bound: FlushBound) {
        let _claim = ThreadClaim::new(&self.shared);
        let start = wall_now();
        let mut deadline = bound
            .until
            .unwrap_or(start + bound.for_duration.unwrap_or(0.0));
        if let Some(grid) = bound.align_to {
            if grid > 0.0 {
                deadline = deadline - (deadline % grid) + grid;
            }
        }

        loop {
            let now = wall_now();
            if now >= deadline {
                return;
            }

            match self.shared.rx.try_recv() {
                Ok(envelope) => {
                    if self.handle(envelope) {
                        return;
                    }
                    continue;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return,
            }

            if let Some(task) = self.pop_due() {
                self.dispatch(task);
                continue;
            }

            let wait = self.wait_duration(Some(deadline));
            match self.shared.rx.recv_timeout(wait) {
                Ok(envelope) => {
                    if self.handle(envelope) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Enqueue the stop sentinel; `run` exits after draining ready items.
    pub fn stop(&self) {
        let _ = self.shared.tx.send(Envelope::Stop);
    }

    /// Serialize a foreign-thread write against in-flight execution.
    ///
    /// Returns `None` when the caller is already on the reactor thread —
    /// the execution mutex is then already held by the current dispatch and
    /// acquiring it again would self-deadlock.
    pub fn lock_execution(&self) -> Option<MutexGuard<'_, ()>> {
        let on_reactor_thread =
            *self.shared.reactor_thread.lock() == Some(std::thread::current().id());
        if on_reactor_thread {
            None
        } else {
            Some(self.shared.exec.lock())
        }
    }

    /// Monotone count of dispatched items (mailbox and timer alike). The
    /// canary samples this for liveness detection.
    pub fn tasks_executed(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    /// Whether a task is pending for `key` (introspection).
    pub fn is_pending(&self, key: &str) -> bool {
        self.shared.timers.lock().tasks.contains_key(key)
    }

    /// Due time of the pending task for `key`, if any (introspection).
    pub fn pending_due(&self, key: &str) -> Option<f64> {
        self.shared.timers.lock().tasks.get(key).map(|t| t.due)
    }

    /// Returns true when the loop should exit.
    fn handle(&self, envelope: Envelope) -> bool {
        match envelope {
            Envelope::Run(job) => {
                self.execute(job);
                false
            }
            Envelope::Wake => false,
            Envelope::Stop => {
                self.drain_ready();
                true
            }
        }
    }

    /// Run one mailbox job under the execution mutex.
    fn execute(&self, mut job: Job) {
        {
            let _exec = self.shared.exec.lock();
            job();
        }
        self.shared.executed.fetch_add(1, Ordering::Relaxed);
    }

    fn pop_due(&self) -> Option<Task> {
        self.shared.timers.lock().pop_due(wall_now())
    }

    /// Run one timer task under the execution mutex, then respawn it if it
    /// loops. The skip decision uses the wall clock at the moment the run
    /// starts, per the grid rules in the module docs.
    fn dispatch(&self, mut task: Task) {
        let started = wall_now();
        let mut skipped = false;
        let next_due = task.looping.as_ref().map(|spec| {
            let mut next = task.due + spec.period - (task.due % spec.period);
            if next - started < spec.skip_fraction * spec.period {
                next += spec.period;
                skipped = true;
            }
            next
        });

        {
            let _exec = self.shared.exec.lock();
            (task.job)();
        }
        self.shared.executed.fetch_add(1, Ordering::Relaxed);

        if skipped {
            debug!(key = %task.key, "periodic task overloaded, skipping one period");
            if let Some(callback) = task
                .looping
                .as_mut()
                .and_then(|spec| spec.skip_callback.as_mut())
            {
                callback();
            }
        }

        if let Some(due) = next_due {
            let mut state = self.shared.timers.lock();
            // A task scheduled under this key during the run supersedes the
            // loop's own respawn.
            if !state.tasks.contains_key(&task.key) {
                let seq = state.fresh_seq();
                task.due = due;
                task.seq = seq;
                state.insert(task);
            }
        }
    }

    /// Execute everything already ready (queued mailbox items and due
    /// timers), without waiting for more.
    fn drain_ready(&self) {
        loop {
            match self.shared.rx.try_recv() {
                Ok(Envelope::Run(job)) => {
                    self.execute(job);
                    continue;
                }
                Ok(_) => continue,
                Err(_) => {}
            }
            match self.pop_due() {
                Some(task) => self.dispatch(task),
                None => return,
            }
        }
    }

    /// How long to block for the next mailbox item: until the next due
    /// timer, capped by the max poll interval and an optional deadline.
    fn wait_duration(&self, deadline: Option<f64>) -> Duration {
        let now = wall_now();
        let mut horizon = now + self.shared.max_poll.as_secs_f64();
        if let Some(due) = self.shared.timers.lock().next_due() {
            horizon = horizon.min(due);
        }
        if let Some(deadline) = deadline {
            horizon = horizon.min(deadline);
        }
        Duration::from_secs_f64((horizon - now).max(0.0))
    }
}
