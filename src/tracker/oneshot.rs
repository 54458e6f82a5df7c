//! Run an action and wait for the turn it starts to settle.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Duration;

use pin_project_lite::pin_project;

use super::{Subscription, TrackContext, Tracker, TrackerConfig};
use crate::error::{AsyncError, Error, Result};
use crate::scheduler::{self, EventLoop};

/// Options for [`run_tracked`] and [`run_tracked_async`].
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Timers with a delay below this are tracked. `None` tracks no timers.
    pub timer_threshold: Option<Duration>,
    /// Receives uncaught errors. Setting it enables error capture.
    pub on_error: Option<Rc<dyn Fn(&AsyncError)>>,
    /// Attach the scheduling site to captured errors.
    pub long_stack_traces: bool,
    /// Resolve when the tracker is quiescent instead of at turn-end.
    pub wait_for_async_done: bool,
}

impl RunOptions {
    /// Create default options: resolve at the first turn-end, errors
    /// escalate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track timers whose delay is below `threshold`.
    #[must_use]
    pub fn timer_threshold(mut self, threshold: Duration) -> Self {
        self.timer_threshold = Some(threshold);
        self
    }

    /// Capture uncaught errors and hand them to `handler`.
    #[must_use]
    pub fn on_error(mut self, handler: impl Fn(&AsyncError) + 'static) -> Self {
        self.on_error = Some(Rc::new(handler));
        self
    }

    /// Attach the scheduling site to captured errors.
    #[must_use]
    pub fn long_stack_traces(mut self) -> Self {
        self.long_stack_traces = true;
        self
    }

    /// Resolve on `on_async_done` rather than `on_turn_end`.
    #[must_use]
    pub fn wait_for_async_done(mut self, wait: bool) -> Self {
        self.wait_for_async_done = wait;
        self
    }

    fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            timer_threshold: self.timer_threshold,
            capture_errors: self.on_error.is_some(),
            long_stack_traces: self.long_stack_traces,
        }
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("timer_threshold", &self.timer_threshold)
            .field("on_error", &self.on_error.is_some())
            .field("long_stack_traces", &self.long_stack_traces)
            .field("wait_for_async_done", &self.wait_for_async_done)
            .finish()
    }
}

/// Progress of the action behind a [`Tracked`].
enum Outcome<R> {
    /// Not finished.
    Pending,
    Ready(R),
    /// The action panicked.
    Failed(String),
    Taken,
}

struct Settle<R> {
    outcome: Outcome<R>,
    result: Option<Result<R>>,
    delivered: bool,
    waker: Option<Waker>,
}

type Shared<R> = Rc<RefCell<Settle<R>>>;

fn mark_ready<R>(shared: &Shared<R>, value: R) {
    shared.borrow_mut().outcome = Outcome::Ready(value);
}

/// Runs `f`; a panic marks the run failed and keeps unwinding into the
/// context's error handling.
fn failing_on_panic<R, T>(shared: &Shared<R>, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            let error = AsyncError::from_panic(payload);
            shared.borrow_mut().outcome = Outcome::Failed(error.to_string());
            panic::resume_unwind(error.into_payload())
        }
    }
}

/// Moves a finished outcome into the result slot. Returns `false` if the
/// action has not finished.
fn try_settle<R>(shared: &Shared<R>) -> bool {
    let waker = {
        let mut settle = shared.borrow_mut();
        let result = match std::mem::replace(&mut settle.outcome, Outcome::Taken) {
            Outcome::Ready(value) => Ok(value),
            Outcome::Failed(message) => Err(Error::ActionFailed(message)),
            other => {
                settle.outcome = other;
                return false;
            }
        };
        settle.result = Some(result);
        settle.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
    true
}

pin_project! {
    /// The async action's future, reporting its value or its own panic to
    /// the run.
    struct Watched<F, R> {
        #[pin]
        future: F,
        shared: Shared<R>,
    }
}

impl<F: Future<Output = R>, R> Future for Watched<F, R> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        let this = self.project();
        let future = this.future;
        match failing_on_panic(this.shared, || future.poll(cx)) {
            Poll::Ready(value) => {
                mark_ready(this.shared, value);
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Runs `action` in a tracker over the current context and resolves once
/// the turn it starts ends.
///
/// The action is deferred as a microtask inside the tracked context, so it
/// has not started when this function returns. The returned future resolves
/// at the first turn-end (or `on_async_done` with
/// [`RunOptions::wait_for_async_done`]) after the action returned.
///
/// A panic in the action is published to [`RunOptions::on_error`] when one
/// is set, and the future then resolves to [`Error::ActionFailed`]. Without
/// a handler the panic escalates out of the event loop. Panics in work the
/// action scheduled only reach the handler.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use turnkit::{run_tracked, RunOptions};
///
/// let tracked = run_tracked(
///     |_| {
///         turnkit::create_timer(Duration::from_millis(10), || println!("fired"));
///         "started"
///     },
///     RunOptions::new()
///         .timer_threshold(Duration::from_secs(1))
///         .wait_for_async_done(true),
/// );
///
/// assert_eq!(tracked.wait().unwrap(), "started");
/// ```
pub fn run_tracked<R, F>(action: F, options: RunOptions) -> Tracked<R>
where
    R: 'static,
    F: FnOnce(&TrackContext) -> R + 'static,
{
    launch(options, move |tracker, shared| {
        let context = tracker.context().clone();
        context.schedule_microtask(move || {
            let track = tracker.track_context();
            let value = failing_on_panic(&shared, || action(&track));
            mark_ready(&shared, value);
        });
    })
}

/// Like [`run_tracked`] for an async action.
///
/// The future returned by `action` runs as a task spawned in the tracked
/// context; every poll is tracked work. The result is available at the
/// first settle after the future completed. The run fails only if the
/// future itself panics.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use turnkit::scheduler::sleep;
/// use turnkit::{run_tracked_async, RunOptions};
///
/// let tracked = run_tracked_async(
///     |_| async {
///         sleep(Duration::from_millis(50)).await;
///         42
///     },
///     RunOptions::new(),
/// );
///
/// assert_eq!(tracked.wait().unwrap(), 42);
/// ```
pub fn run_tracked_async<R, F, Fut>(action: F, options: RunOptions) -> Tracked<R>
where
    R: 'static,
    F: FnOnce(TrackContext) -> Fut + 'static,
    Fut: Future<Output = R> + 'static,
{
    launch(options, move |tracker, shared| {
        let context = tracker.context().clone();
        context.schedule_microtask(move || {
            let future = failing_on_panic(&shared, || action(tracker.track_context()));
            let _task = scheduler::spawn(Watched { future, shared });
        });
    })
}

fn launch<R: 'static>(
    options: RunOptions,
    start: impl FnOnce(Tracker, Shared<R>),
) -> Tracked<R> {
    let tracker = Tracker::for_current(options.tracker_config());
    let shared: Shared<R> = Rc::new(RefCell::new(Settle {
        outcome: Outcome::Pending,
        result: None,
        delivered: false,
        waker: None,
    }));

    if tracker.in_turn() {
        tracing::debug!(
            context = %tracker.context().id(),
            "tracker already mid-turn; waiting for the action's own turn"
        );
    }

    let on_error = options
        .on_error
        .clone()
        .map(|handler| tracker.on_error().subscribe(move |error| handler(error)));

    let channel = if options.wait_for_async_done {
        tracker.on_async_done().clone()
    } else {
        tracker.on_turn_end().clone()
    };
    let settled = Rc::clone(&shared);
    let on_settle: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
    let registration = Rc::clone(&on_settle);
    let subscription = channel.subscribe(move |_| {
        if try_settle(&settled) {
            if let Some(subscription) = registration.borrow_mut().take() {
                subscription.unsubscribe();
            }
        }
    });
    *on_settle.borrow_mut() = Some(subscription);

    start(tracker.clone(), Rc::clone(&shared));
    Tracked {
        shared,
        tracker,
        on_settle,
        on_error,
    }
}

/// Result of [`run_tracked`]: a future resolving to the action's value once
/// its turn has settled.
///
/// The `on_error` handler stays subscribed until the `Tracked` is dropped.
#[must_use = "futures do nothing unless polled"]
pub struct Tracked<R> {
    shared: Shared<R>,
    tracker: Tracker,
    on_settle: Rc<RefCell<Option<Subscription>>>,
    on_error: Option<Subscription>,
}

impl<R> Tracked<R> {
    /// The tracker the action runs under.
    #[must_use]
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Returns `true` once the result is available.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.shared.borrow().result.is_some()
    }

    /// Drives this thread's event loop until the result is available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ActionFailed`] if the action's panic was captured,
    /// or [`Error::Stalled`] if the loop ran out of work first.
    pub fn wait(self) -> Result<R> {
        EventLoop::current().block_on(self)?
    }
}

impl<R> Future for Tracked<R> {
    type Output = Result<R>;

    /// # Panics
    ///
    /// Panics when polled again after returning `Ready`.
    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Result<R>> {
        let mut settle = self.shared.borrow_mut();
        assert!(!settle.delivered, "`Tracked` polled after completion");
        match settle.result.take() {
            Some(result) => {
                settle.delivered = true;
                Poll::Ready(result)
            }
            None => {
                settle.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<R> Drop for Tracked<R> {
    fn drop(&mut self) {
        if let Some(subscription) = self.on_settle.borrow_mut().take() {
            subscription.unsubscribe();
        }
        if let Some(subscription) = self.on_error.take() {
            subscription.unsubscribe();
        }
    }
}

impl<R> fmt::Debug for Tracked<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("tracker", &self.tracker)
            .field("settled", &self.is_settled())
            .finish()
    }
}
