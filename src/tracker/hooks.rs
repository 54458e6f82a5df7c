//! Interceptors installed on tracked contexts.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use super::state::TrackerState;
use super::TrackerShared;
use crate::context::{Callback, Context, Delegate, Interceptor};
use crate::error::AsyncError;
use crate::scheduler::{Timer, TimerControl};

thread_local! {
    /// Where the callback currently executing was scheduled.
    static SCHEDULED_AT: RefCell<Option<Rc<Backtrace>>> = const { RefCell::new(None) };
}

/// Runs `f` with `trace` as the scheduling site of the current callback.
fn with_scheduled_at<R>(trace: Option<Rc<Backtrace>>, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Rc<Backtrace>>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            let _ = SCHEDULED_AT.try_with(|slot| slot.replace(previous));
        }
    }

    if trace.is_none() {
        return f();
    }
    let _restore = Restore(SCHEDULED_AT.with(|slot| slot.replace(trace)));
    f()
}

fn scheduled_at() -> Option<Rc<Backtrace>> {
    SCHEDULED_AT.with(|slot| slot.borrow().clone())
}

/// Publishes `error` on the tracker's error channel.
fn capture(shared: &TrackerShared, context: &Context, error: AsyncError) {
    let error = error.with_trace(scheduled_at());
    tracing::debug!(context = %context.id(), %error, "captured uncaught error");
    shared.errors.emit(&error);
}

/// Counts calls, microtasks and short timers of a tracked context.
pub(super) struct TrackingInterceptor {
    pub(super) shared: Rc<TrackerShared>,
}

impl TrackingInterceptor {
    fn trace(&self) -> Option<Rc<Backtrace>> {
        self.shared
            .config
            .long_stack_traces
            .then(|| Rc::new(Backtrace::force_capture()))
    }
}

impl Interceptor for TrackingInterceptor {
    fn run(&self, parent: Delegate<'_>, context: &Context, f: &mut dyn FnMut()) {
        self.shared.update(TrackerState::enter_call);
        let result = panic::catch_unwind(AssertUnwindSafe(|| parent.run(context, f)));
        self.shared.update(TrackerState::exit_call);
        if let Err(payload) = result {
            panic::resume_unwind(payload);
        }
    }

    fn schedule_microtask(&self, parent: Delegate<'_>, context: &Context, task: Callback) {
        self.shared.update(TrackerState::microtask_scheduled);
        let completion = Completion::new(&self.shared, TrackerState::microtask_finished);
        let trace = self.trace();

        parent.schedule_microtask(
            context,
            Box::new(move || {
                let result = with_scheduled_at(trace, || panic::catch_unwind(AssertUnwindSafe(task)));
                completion.complete();
                if let Err(payload) = result {
                    panic::resume_unwind(payload);
                }
            }),
        );
    }

    fn create_timer(
        &self,
        parent: Delegate<'_>,
        context: &Context,
        delay: Duration,
        callback: Callback,
    ) -> Timer {
        if !self.shared.config.tracks_timer(delay) {
            return parent.create_timer(context, delay, callback);
        }

        self.shared.update(TrackerState::timer_created);
        let completion = Rc::new(Completion::new(&self.shared, TrackerState::timer_finished));
        let trace = self.trace();

        let on_fire = Rc::clone(&completion);
        let inner = parent.create_timer(
            context,
            delay,
            Box::new(move || {
                // Released before the callback runs so the turn it opens can
                // end quiescent.
                on_fire.complete();
                with_scheduled_at(trace, callback);
            }),
        );
        Timer::new(TrackedTimer { inner, completion })
    }

    fn handle_uncaught_error(&self, parent: Delegate<'_>, context: &Context, error: AsyncError) {
        if self.shared.config.capture_errors {
            capture(&self.shared, context, error);
        } else {
            parent.handle_uncaught_error(context, error);
        }
    }
}

/// Captures uncaught errors for work started through `Tracker::run_guarded`.
pub(super) struct ErrorCapture {
    pub(super) shared: Rc<TrackerShared>,
}

impl Interceptor for ErrorCapture {
    fn handle_uncaught_error(&self, _parent: Delegate<'_>, context: &Context, error: AsyncError) {
        capture(&self.shared, context, error);
    }
}

/// One-shot release of a counted unit of work.
///
/// Dropping an incomplete `Completion` (its callback was discarded without
/// running) releases it as well.
struct Completion {
    shared: Rc<TrackerShared>,
    release: fn(&mut TrackerState),
    done: Cell<bool>,
}

impl Completion {
    fn new(shared: &Rc<TrackerShared>, release: fn(&mut TrackerState)) -> Self {
        Self {
            shared: Rc::clone(shared),
            release,
            done: Cell::new(false),
        }
    }

    fn complete(&self) {
        if !self.done.replace(true) {
            self.shared.update(self.release);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.complete();
        }
    }
}

/// A tracked timer. Firing and cancelling both release the timer's count,
/// whichever comes first.
struct TrackedTimer {
    inner: Timer,
    completion: Rc<Completion>,
}

impl TimerControl for TrackedTimer {
    fn cancel(&self) {
        self.inner.cancel();
        self.completion.complete();
    }

    fn is_active(&self) -> bool {
        self.inner.is_active()
    }
}
