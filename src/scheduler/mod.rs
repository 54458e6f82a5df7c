//! The cooperative event loop
//!
//! This module provides [`EventLoop`], the single-threaded scheduler every
//! [`Context`] ultimately delegates to. Like a test executor it never runs on
//! its own: you drive it with [`step`](EventLoop::step),
//! [`run_microtasks`](EventLoop::run_microtasks),
//! [`advance`](EventLoop::advance), [`run_until_idle`](EventLoop::run_until_idle)
//! or [`block_on`](EventLoop::block_on).
//!
//! Each thread has its own loop. Timers are measured on a virtual
//! [`VirtualClock`]; the loop jumps the clock forward to the next deadline
//! instead of waiting.
//!
//! # Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use std::time::Duration;
//! use turnkit::scheduler::EventLoop;
//!
//! let event_loop = EventLoop::current();
//! let log = Rc::new(RefCell::new(Vec::new()));
//!
//! let l = Rc::clone(&log);
//! turnkit::create_timer(Duration::from_millis(10), move || l.borrow_mut().push("timer"));
//! let l = Rc::clone(&log);
//! turnkit::schedule_microtask(move || l.borrow_mut().push("microtask"));
//!
//! event_loop.run_until_idle();
//! assert_eq!(*log.borrow(), vec!["microtask", "timer"]);
//! ```

mod sleep;
mod task;
mod timer;

pub use sleep::{sleep, timeout, Sleep, Timeout};
pub use task::{TaskHandle, TaskId};
pub use timer::{Timer, TimerControl};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Wake, Waker};
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{VirtualClock, TimerQueue};
use crate::context::{Callback, Context};
use crate::error::{Error, Result};
use task::{TaskSlot, TaskWaker};
use timer::HostTimer;

/// Upper bound on units of work `run_until_idle` executes before assuming
/// the program re-arms timers forever.
const MAX_IDLE_ITERATIONS: usize = 1_000_000;

thread_local! {
    static EVENT_LOOP: EventLoop = EventLoop::new();
}

/// A single-threaded cooperative scheduler with a microtask queue and
/// virtual-time timers.
///
/// Cloning is cheap; all clones on a thread refer to that thread's loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

struct LoopInner {
    /// Deferred work, run in FIFO order before any timer.
    microtasks: std::cell::RefCell<VecDeque<Callback>>,
    /// Timers keyed by virtual deadline.
    timers: std::cell::RefCell<TimerQueue<Callback>>,
    /// Spawned futures.
    tasks: std::cell::RefCell<HashMap<TaskId, TaskSlot>>,
    /// Wakes issued from other threads.
    remote_wakes: Arc<Mutex<Vec<TaskId>>>,
    clock: VirtualClock,
    owner: ThreadId,
}

impl EventLoop {
    fn new() -> Self {
        Self {
            inner: Rc::new(LoopInner {
                microtasks: std::cell::RefCell::new(VecDeque::new()),
                timers: std::cell::RefCell::new(TimerQueue::new()),
                tasks: std::cell::RefCell::new(HashMap::new()),
                remote_wakes: Arc::new(Mutex::new(Vec::new())),
                clock: VirtualClock::new(),
                owner: std::thread::current().id(),
            }),
        }
    }

    /// Returns this thread's event loop.
    #[must_use]
    pub fn current() -> Self {
        EVENT_LOOP.with(Clone::clone)
    }

    /// Like [`current`](Self::current), but `None` while the thread is
    /// being torn down.
    pub(crate) fn try_current() -> Option<Self> {
        EVENT_LOOP.try_with(Clone::clone).ok()
    }

    /// Returns the loop's virtual clock.
    #[must_use]
    pub fn clock(&self) -> VirtualClock {
        self.inner.clock.clone()
    }

    /// Returns the current virtual time.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.inner.clock.now()
    }

    /// Number of queued microtasks.
    #[must_use]
    pub fn pending_microtasks(&self) -> usize {
        self.inner.microtasks.borrow().len()
    }

    /// Number of timers waiting to fire.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    /// Number of spawned tasks that have not finished.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    /// Returns `true` if there is nothing left to run, now or later.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending_microtasks() == 0
            && self.pending_timers() == 0
            && self.inner.remote_wakes.lock().is_empty()
    }

    /// Executes one unit of work: a microtask if any is queued, otherwise the
    /// earliest timer, moving the clock to its deadline if needed.
    ///
    /// Returns `false` if there was nothing to run. While the clock is
    /// paused only timers that are already due can fire.
    pub fn step(&self) -> bool {
        self.drain_remote_wakes();
        self.run_one_microtask() || self.fire_next_timer(None)
    }

    /// Runs queued microtasks, including ones queued while running, until the
    /// queue is empty. Returns how many ran.
    pub fn run_microtasks(&self) -> usize {
        let mut count = 0;
        loop {
            self.drain_remote_wakes();
            if !self.run_one_microtask() {
                return count;
            }
            count += 1;
        }
    }

    /// Runs microtasks and every timer already due, without moving the
    /// clock. Returns how many units of work ran.
    pub fn run_until_stalled(&self) -> usize {
        let mut count = self.run_microtasks();
        while self.fire_next_timer(Some(self.now())) {
            count += 1 + self.run_microtasks();
        }
        count
    }

    /// Moves the clock forward by `duration`, firing timers that fall due in
    /// deadline order and draining microtasks after each.
    ///
    /// # Panics
    ///
    /// Panics if the clock is paused.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::cell::Cell;
    /// use std::rc::Rc;
    /// use std::time::Duration;
    /// use turnkit::scheduler::EventLoop;
    ///
    /// let event_loop = EventLoop::current();
    /// let fired = Rc::new(Cell::new(0));
    /// for secs in [1, 2, 10] {
    ///     let fired = Rc::clone(&fired);
    ///     turnkit::create_timer(Duration::from_secs(secs), move || fired.set(fired.get() + 1));
    /// }
    ///
    /// event_loop.advance(Duration::from_secs(5));
    /// assert_eq!(fired.get(), 2);
    /// assert_eq!(event_loop.pending_timers(), 1);
    /// ```
    pub fn advance(&self, duration: Duration) -> usize {
        assert!(
            !self.inner.clock.is_paused(),
            "virtual clock is paused; resume it before advancing"
        );
        let target = self.now() + duration;
        let mut count = self.run_microtasks();
        while self.fire_next_timer(Some(target)) {
            count += 1 + self.run_microtasks();
        }
        self.inner.clock.advance_to(target);
        count
    }

    /// Runs until no microtasks or timers remain, jumping the clock from
    /// deadline to deadline. Returns how many units of work ran.
    ///
    /// # Panics
    ///
    /// Panics if work keeps being re-scheduled for more than a million
    /// steps.
    pub fn run_until_idle(&self) -> usize {
        let mut count = 0;
        while self.step() {
            count += 1;
            assert!(
                count <= MAX_IDLE_ITERATIONS,
                "Event loop ran for {MAX_IDLE_ITERATIONS} steps without going idle"
            );
        }
        count
    }

    /// Drives the loop until `future` completes.
    ///
    /// The future is polled on the calling stack; between polls the loop
    /// executes microtasks and timers until the future is woken.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stalled`] if the future is still pending when there
    /// is nothing left to run.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        let mut future = std::pin::pin!(future);
        let flag = Arc::new(WakeFlag::default());
        let waker = Waker::from(Arc::clone(&flag));
        let mut cx = TaskContext::from_waker(&waker);

        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Ok(output);
            }
            while !flag.take() {
                if !self.step() && !flag.take() {
                    let waiting = self.task_count();
                    tracing::debug!(waiting, "block_on stalled");
                    return Err(Error::Stalled { waiting });
                }
            }
        }
    }

    /// Spawns `future` as a task of the current context.
    ///
    /// Each poll of the task runs as a microtask inside that context, so the
    /// task's progress is visible to the context's interceptors.
    pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let id = TaskId::new();
        let (guard, handle) = task::join_pair(id);
        let wrapped = async move {
            let output = future.await;
            guard.complete(output);
        };

        self.inner.tasks.borrow_mut().insert(
            id,
            TaskSlot {
                context: Context::current(),
                future: Some(Box::pin(wrapped)),
                scheduled: false,
            },
        );
        tracing::trace!(task = %id, "task spawned");
        self.schedule_poll(id);
        handle
    }

    /// Drops every queued microtask, timer and task.
    ///
    /// The clock keeps its current time.
    pub fn reset(&self) {
        let microtasks = std::mem::take(&mut *self.inner.microtasks.borrow_mut());
        let timers = std::mem::take(&mut *self.inner.timers.borrow_mut());
        let tasks = std::mem::take(&mut *self.inner.tasks.borrow_mut());
        self.inner.remote_wakes.lock().clear();
        drop(microtasks);
        drop(timers);
        drop(tasks);
    }

    pub(crate) fn push_microtask(&self, task: Callback) {
        self.inner.microtasks.borrow_mut().push_back(task);
    }

    pub(crate) fn insert_timer(&self, delay: Duration, callback: Callback) -> Timer {
        let deadline = self.now() + delay;
        let id = self.inner.timers.borrow_mut().insert(deadline, callback);
        tracing::trace!(timer = %id, ?deadline, "timer created");
        Timer::new(HostTimer {
            id,
            event_loop: Rc::downgrade(&self.inner),
        })
    }

    /// Queues a poll of task `id` unless one is already queued.
    pub(crate) fn schedule_poll(&self, id: TaskId) {
        let context = {
            let mut tasks = self.inner.tasks.borrow_mut();
            let Some(slot) = tasks.get_mut(&id) else {
                return;
            };
            if slot.scheduled {
                return;
            }
            slot.scheduled = true;
            slot.context.clone()
        };
        context.schedule_microtask(move || EventLoop::current().poll_task(id));
    }

    pub(crate) fn abort_task(&self, id: TaskId) {
        let slot = self.inner.tasks.borrow_mut().remove(&id);
        if slot.is_some() {
            tracing::trace!(task = %id, "task aborted");
        }
        drop(slot);
    }

    fn poll_task(&self, id: TaskId) {
        let future = {
            let mut tasks = self.inner.tasks.borrow_mut();
            let Some(slot) = tasks.get_mut(&id) else {
                return;
            };
            slot.scheduled = false;
            slot.future.take()
        };
        let Some(mut future) = future else {
            return;
        };

        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            owner: self.inner.owner,
            remote: Arc::clone(&self.inner.remote_wakes),
        }));
        let mut cx = TaskContext::from_waker(&waker);

        match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => {
                let orphaned = {
                    let mut tasks = self.inner.tasks.borrow_mut();
                    match tasks.get_mut(&id) {
                        Some(slot) => {
                            slot.future = Some(future);
                            None
                        }
                        None => Some(future),
                    }
                };
                drop(orphaned);
            }
            Ok(Poll::Ready(())) => {
                let slot = self.inner.tasks.borrow_mut().remove(&id);
                tracing::trace!(task = %id, "task completed");
                drop(slot);
                drop(future);
            }
            Err(payload) => {
                let slot = self.inner.tasks.borrow_mut().remove(&id);
                drop(slot);
                drop(future);
                panic::resume_unwind(payload);
            }
        }
    }

    fn run_one_microtask(&self) -> bool {
        let task = self.inner.microtasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Fires the earliest timer whose deadline is at or before `limit`
    /// (any deadline when `limit` is `None`).
    fn fire_next_timer(&self, limit: Option<Duration>) -> bool {
        let next = self.inner.timers.borrow_mut().next_deadline();
        let Some(deadline) = next else {
            return false;
        };
        if limit.is_some_and(|limit| deadline > limit) {
            return false;
        }
        if deadline > self.now() {
            if self.inner.clock.is_paused() {
                return false;
            }
            self.inner.clock.advance_to(deadline);
        }

        let due = self.inner.timers.borrow_mut().pop_due(self.now());
        match due {
            Some((id, callback)) => {
                tracing::trace!(timer = %id, now = ?self.now(), "timer fired");
                callback();
                true
            }
            None => false,
        }
    }

    fn drain_remote_wakes(&self) {
        let woken = std::mem::take(&mut *self.inner.remote_wakes.lock());
        for id in woken {
            self.schedule_poll(id);
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("now", &self.now())
            .field("microtasks", &self.pending_microtasks())
            .field("timers", &self.pending_timers())
            .field("tasks", &self.task_count())
            .finish()
    }
}

/// Queues `f` as a microtask of the current context.
pub fn schedule_microtask(f: impl FnOnce() + 'static) {
    Context::current().schedule_microtask(f);
}

/// Registers `f` to run in the current context after `delay` of virtual
/// time.
pub fn create_timer(delay: Duration, f: impl FnOnce() + 'static) -> Timer {
    Context::current().create_timer(delay, f)
}

/// Spawns `future` on this thread's loop as a task of the current context.
pub fn spawn<F>(future: F) -> TaskHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    EventLoop::current().spawn(future)
}

/// Waker used by `block_on`.
#[derive(Default)]
struct WakeFlag {
    woken: AtomicBool,
}

impl WakeFlag {
    fn take(&self) -> bool {
        self.woken.swap(false, Ordering::SeqCst)
    }
}

impl Wake for WakeFlag {
    fn wake(self: Arc<Self>) {
        self.woken.store(true, Ordering::SeqCst);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Callback) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        let make = move |label: &'static str| -> Callback {
            let sink = Rc::clone(&sink);
            Box::new(move || sink.borrow_mut().push(label))
        };
        (log, make)
    }

    #[test]
    fn test_new_loop_is_idle() {
        let event_loop = EventLoop::current();
        assert!(event_loop.is_idle());
        assert!(!event_loop.step());
        assert_eq!(event_loop.run_until_idle(), 0);
    }

    #[test]
    fn test_microtasks_run_fifo_including_nested() {
        let event_loop = EventLoop::current();
        let (log, make) = recorder();

        let nested = make("nested");
        let sink = Rc::clone(&log);
        event_loop.push_microtask(Box::new(move || {
            sink.borrow_mut().push("first");
            EventLoop::current().push_microtask(nested);
        }));
        event_loop.push_microtask(make("second"));

        assert_eq!(event_loop.run_microtasks(), 3);
        assert_eq!(*log.borrow(), vec!["first", "second", "nested"]);
    }

    #[test]
    fn test_microtasks_run_before_timers() {
        let event_loop = EventLoop::current();
        let (log, make) = recorder();

        let _timer = event_loop.insert_timer(Duration::ZERO, make("timer"));
        event_loop.push_microtask(make("microtask"));

        assert!(event_loop.step());
        assert!(event_loop.step());
        assert_eq!(*log.borrow(), vec!["microtask", "timer"]);
    }

    #[test]
    fn test_run_until_stalled_does_not_move_clock() {
        let event_loop = EventLoop::current();
        let (log, make) = recorder();
        let start = event_loop.now();

        let _due = event_loop.insert_timer(Duration::ZERO, make("due"));
        let _later = event_loop.insert_timer(Duration::from_secs(1), make("later"));

        assert_eq!(event_loop.run_until_stalled(), 1);
        assert_eq!(*log.borrow(), vec!["due"]);
        assert_eq!(event_loop.now(), start);
        assert_eq!(event_loop.pending_timers(), 1);
        event_loop.reset();
    }

    #[test]
    fn test_run_until_idle_jumps_between_deadlines() {
        let event_loop = EventLoop::current();
        let (log, make) = recorder();
        let start = event_loop.now();

        let _b = event_loop.insert_timer(Duration::from_secs(20), make("b"));
        let _a = event_loop.insert_timer(Duration::from_secs(10), make("a"));

        assert_eq!(event_loop.run_until_idle(), 2);
        assert_eq!(*log.borrow(), vec!["a", "b"]);
        assert_eq!(event_loop.now() - start, Duration::from_secs(20));
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let event_loop = EventLoop::current();
        let (log, make) = recorder();

        let timer = event_loop.insert_timer(Duration::from_secs(1), make("cancelled"));
        assert!(timer.is_active());
        timer.cancel();
        assert!(!timer.is_active());

        event_loop.run_until_idle();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_paused_clock_holds_timers() {
        let event_loop = EventLoop::current();
        let (log, make) = recorder();

        let _timer = event_loop.insert_timer(Duration::from_secs(1), make("timer"));
        event_loop.clock().pause();
        assert!(!event_loop.step());

        event_loop.clock().resume();
        assert!(event_loop.step());
        assert_eq!(*log.borrow(), vec!["timer"]);
    }

    #[test]
    fn test_spawned_task_completes() {
        let event_loop = EventLoop::current();
        let handle = spawn(async { 21 * 2 });

        assert!(!handle.is_finished());
        assert_eq!(event_loop.task_count(), 1);
        event_loop.run_microtasks();
        assert_eq!(handle.take(), Some(42));
        assert_eq!(event_loop.task_count(), 0);
    }

    #[test]
    fn test_block_on_awaits_spawned_task_with_sleep() {
        let event_loop = EventLoop::current();
        let start = event_loop.now();
        let handle = spawn(async {
            sleep(Duration::from_millis(250)).await;
            "slept"
        });

        let output = event_loop.block_on(handle).unwrap();
        assert_eq!(output, Some("slept"));
        assert_eq!(event_loop.now() - start, Duration::from_millis(250));
    }

    #[test]
    fn test_block_on_reports_stall() {
        let event_loop = EventLoop::current();
        let result = event_loop.block_on(std::future::pending::<()>());
        assert!(matches!(result, Err(Error::Stalled { waiting: 0 })));
    }

    #[test]
    fn test_abort_cancels_pending_sleep() {
        let event_loop = EventLoop::current();
        let handle = spawn(async {
            sleep(Duration::from_secs(30)).await;
        });
        event_loop.run_microtasks();
        assert_eq!(event_loop.pending_timers(), 1);

        handle.abort();
        assert!(handle.is_finished());
        assert_eq!(event_loop.pending_timers(), 0);
        assert_eq!(event_loop.task_count(), 0);
    }

    #[test]
    fn test_remote_wake_is_picked_up_on_step() {
        let event_loop = EventLoop::current();
        let polls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&polls);
        let slot: Arc<Mutex<Option<Waker>>> = Arc::new(Mutex::new(None));
        let registered = Arc::clone(&slot);

        let handle = spawn(std::future::poll_fn(move |cx| {
            counter.set(counter.get() + 1);
            if counter.get() == 1 {
                *registered.lock() = Some(cx.waker().clone());
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        }));
        event_loop.run_microtasks();
        assert_eq!(polls.get(), 1);

        let waker = slot.lock().take().unwrap();
        std::thread::spawn(move || waker.wake()).join().unwrap();
        assert!(!event_loop.is_idle());

        event_loop.run_microtasks();
        assert_eq!(polls.get(), 2);
        assert!(handle.is_finished());
    }

    #[test]
    fn test_panicking_task_finishes_handle_and_propagates() {
        let event_loop = EventLoop::current();
        let handle = spawn(async {
            panic!("task failed");
        });

        let result = panic::catch_unwind(AssertUnwindSafe(|| event_loop.run_microtasks()));
        assert!(result.is_err());
        assert!(handle.is_finished());
        assert!(handle.take().is_none());
        assert_eq!(event_loop.task_count(), 0);
    }
}
