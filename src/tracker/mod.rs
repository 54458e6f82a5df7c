//! Turn and quiescence tracking
//!
//! A [`Tracker`] forks the current [`Context`] and counts the work started in
//! the fork: calls running inside it, microtasks queued from it, and
//! (optionally) timers shorter than a threshold. From those counters it
//! derives two signals:
//!
//! - a **turn** begins when the first call enters the context and ends when
//!   no calls or microtasks remain;
//! - the context is **quiescent** when a turn ends with no tracked timers
//!   outstanding.
//!
//! Both are published synchronously on broadcast [`EventChannel`]s at the
//! moment the counters change: `on_turn_begin`, `on_turn_end`,
//! `on_async_done`, plus `on_error` for captured uncaught errors.
//!
//! # Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use turnkit::scheduler::EventLoop;
//! use turnkit::Tracker;
//!
//! let tracker = Tracker::new();
//! let log = Rc::new(RefCell::new(Vec::new()));
//!
//! let l = Rc::clone(&log);
//! tracker.on_turn_begin().subscribe(move |_| l.borrow_mut().push("begin"));
//! let l = Rc::clone(&log);
//! tracker.on_turn_end().subscribe(move |_| l.borrow_mut().push("end"));
//!
//! let l = Rc::clone(&log);
//! tracker.run_tracked(|| {
//!     turnkit::schedule_microtask(move || l.borrow_mut().push("microtask"));
//! });
//! assert!(tracker.in_turn());
//!
//! EventLoop::current().run_microtasks();
//! assert_eq!(*log.borrow(), vec!["begin", "microtask", "end"]);
//! ```

mod cache;
mod config;
mod events;
mod hooks;
mod oneshot;
mod state;
mod track_context;

pub use cache::{clear_context_cache, context_reuse_enabled, set_context_reuse};
pub use config::TrackerConfig;
pub use events::{EventChannel, EventStream, NextEvent, Subscription};
pub use oneshot::{run_tracked, run_tracked_async, RunOptions, Tracked};
pub use state::{TrackerState, Transition};
pub use track_context::TrackContext;

use std::cell::{Cell, OnceCell};
use std::fmt;
use std::rc::Rc;

use crate::context::Context;
use crate::error::AsyncError;
use hooks::{ErrorCapture, TrackingInterceptor};

/// State shared between a tracker's handles and its interceptor.
struct TrackerShared {
    state: Cell<TrackerState>,
    config: TrackerConfig,
    turn_begin: EventChannel<()>,
    turn_end: EventChannel<()>,
    async_done: EventChannel<()>,
    errors: EventChannel<AsyncError>,
}

impl TrackerShared {
    /// Applies `change` to the counters and emits the resulting transition.
    ///
    /// The new state is stored before any listener runs.
    fn update(&self, change: impl FnOnce(&mut TrackerState)) {
        let mut state = self.state.get();
        change(&mut state);
        let transition = state.evaluate();
        self.state.set(state);

        match transition {
            Some(Transition::TurnBegin) => {
                tracing::trace!(?state, "turn begin");
                self.turn_begin.emit(&());
            }
            Some(Transition::TurnEnd { quiescent }) => {
                tracing::trace!(?state, quiescent, "turn end");
                self.turn_end.emit(&());
                if quiescent {
                    tracing::trace!("async done");
                    self.async_done.emit(&());
                }
            }
            None => {}
        }
    }
}

/// Tracks the turns of work started in a forked context.
///
/// Cloning is cheap; clones observe the same context and share channels.
#[derive(Clone)]
pub struct Tracker {
    shared: Rc<TrackerShared>,
    context: Context,
    guarded: OnceCell<Context>,
}

impl Tracker {
    /// Creates a tracker over a fresh fork of the current context, tracking
    /// calls and microtasks but no timers.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(TrackerConfig::default())
    }

    /// Creates a tracker over a fresh fork of the current context.
    #[must_use]
    pub fn with_config(config: TrackerConfig) -> Self {
        let shared = Rc::new(TrackerShared {
            state: Cell::new(TrackerState::default()),
            config,
            turn_begin: EventChannel::new(),
            turn_end: EventChannel::new(),
            async_done: EventChannel::new(),
            errors: EventChannel::new(),
        });
        let context = Context::current().fork(TrackingInterceptor {
            shared: Rc::clone(&shared),
        });
        tracing::debug!(
            context = %context.id(),
            parent = %Context::current().id(),
            config = ?shared.config,
            "tracker created"
        );
        Self::from_parts(shared, context)
    }

    /// Returns a live tracker with the same configuration over the current
    /// context if context reuse is enabled and one exists, or creates and
    /// registers a new one.
    ///
    /// A reused tracker may already be mid-turn.
    #[must_use]
    pub fn for_current(config: TrackerConfig) -> Self {
        if !context_reuse_enabled() {
            return Self::with_config(config);
        }
        let parent = Context::current();
        if let Some(tracker) = cache::lookup(&parent, &config) {
            return tracker;
        }
        let tracker = Self::with_config(config);
        cache::store(&parent, &tracker);
        tracker
    }

    fn from_parts(shared: Rc<TrackerShared>, context: Context) -> Self {
        Self {
            shared,
            context,
            guarded: OnceCell::new(),
        }
    }

    /// Runs `action` inside the tracked context and returns its result.
    ///
    /// Work the action starts is tracked. Panics propagate to the caller
    /// after the call has been counted out.
    pub fn run_tracked<R>(&self, action: impl FnOnce() -> R) -> R {
        self.context.run(action)
    }

    /// Runs `action` in the context the tracker was forked from, so nothing
    /// it starts is tracked.
    pub fn run_excluded<R>(&self, action: impl FnOnce() -> R) -> R {
        match self.context.parent() {
            Some(parent) => parent.run(action),
            None => action(),
        }
    }

    /// Runs `action` tracked, publishing panics from it and from any work it
    /// starts on [`on_error`](Self::on_error) instead of propagating them.
    ///
    /// Returns `None` if `action` itself panicked.
    pub fn run_guarded<R>(&self, action: impl FnOnce() -> R) -> Option<R> {
        let guarded = self.guarded.get_or_init(|| {
            self.context.fork(ErrorCapture {
                shared: Rc::clone(&self.shared),
            })
        });
        guarded.run_guarded(action)
    }

    /// Returns `true` between a turn-begin and its turn-end.
    #[must_use]
    pub fn in_turn(&self) -> bool {
        self.shared.state.get().in_turn()
    }

    /// Returns `true` if the calling code runs inside this tracker's context
    /// or a context forked from it.
    #[must_use]
    pub fn is_tracking(&self) -> bool {
        Context::current().is_within(&self.context)
    }

    /// A snapshot of the tracker's counters.
    #[must_use]
    pub fn state(&self) -> TrackerState {
        self.shared.state.get()
    }

    /// The tracker's configuration.
    #[must_use]
    pub fn config(&self) -> &TrackerConfig {
        &self.shared.config
    }

    /// The tracked context.
    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Emitted when a turn begins.
    #[must_use]
    pub fn on_turn_begin(&self) -> &EventChannel<()> {
        &self.shared.turn_begin
    }

    /// Emitted when a turn ends.
    #[must_use]
    pub fn on_turn_end(&self) -> &EventChannel<()> {
        &self.shared.turn_end
    }

    /// Emitted right after a turn-end that leaves no tracked timers.
    #[must_use]
    pub fn on_async_done(&self) -> &EventChannel<()> {
        &self.shared.async_done
    }

    /// Emitted for each captured uncaught error.
    #[must_use]
    pub fn on_error(&self) -> &EventChannel<AsyncError> {
        &self.shared.errors
    }

    /// A capability handle for code running under this tracker.
    #[must_use]
    pub fn track_context(&self) -> TrackContext {
        TrackContext::new(self.clone())
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("context", &self.context.id())
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::EventLoop;
    use std::cell::RefCell;
    use std::time::Duration;

    fn event_log(tracker: &Tracker) -> Rc<RefCell<Vec<&'static str>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        tracker
            .on_turn_begin()
            .subscribe(move |_| l.borrow_mut().push("begin"));
        let l = Rc::clone(&log);
        tracker
            .on_turn_end()
            .subscribe(move |_| l.borrow_mut().push("end"));
        let l = Rc::clone(&log);
        tracker
            .on_async_done()
            .subscribe(move |_| l.borrow_mut().push("done"));
        log
    }

    #[test]
    fn test_sync_action_begins_and_ends_turn() {
        let tracker = Tracker::new();
        let log = event_log(&tracker);

        let value = tracker.run_tracked(|| 7);
        assert_eq!(value, 7);
        assert_eq!(*log.borrow(), vec!["begin", "end", "done"]);
        assert!(!tracker.in_turn());
    }

    #[test]
    fn test_nested_run_is_a_single_turn() {
        let tracker = Tracker::new();
        let log = event_log(&tracker);

        tracker.run_tracked(|| {
            tracker.run_tracked(|| assert_eq!(tracker.state().nested_calls(), 2));
        });
        assert_eq!(*log.borrow(), vec!["begin", "end", "done"]);
    }

    #[test]
    fn test_in_turn_while_microtask_pending() {
        let tracker = Tracker::new();
        tracker.run_tracked(|| crate::schedule_microtask(|| {}));

        assert!(tracker.in_turn());
        assert_eq!(tracker.state().pending_microtasks(), 1);
        EventLoop::current().run_microtasks();
        assert!(!tracker.in_turn());
        assert!(tracker.state().is_quiescent());
    }

    #[test]
    fn test_panicking_action_is_counted_out() {
        let tracker = Tracker::new();
        let log = event_log(&tracker);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tracker.run_tracked(|| panic!("sync failure"));
        }));
        assert!(result.is_err());
        assert_eq!(tracker.state().nested_calls(), 0);
        assert_eq!(*log.borrow(), vec!["begin", "end", "done"]);
    }

    #[test]
    fn test_is_tracking_follows_context() {
        let tracker = Tracker::new();
        assert!(!tracker.is_tracking());
        assert!(tracker.run_tracked(|| tracker.is_tracking()));
        assert!(tracker.run_tracked(|| tracker.run_excluded(|| !tracker.is_tracking())));
    }

    #[test]
    fn test_excluded_work_is_not_counted() {
        let tracker = Tracker::new();
        let log = event_log(&tracker);

        tracker.run_excluded(|| crate::schedule_microtask(|| {}));
        assert!(log.borrow().is_empty());
        assert_eq!(tracker.state().pending_microtasks(), 0);
        EventLoop::current().run_microtasks();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_untracked_timer_leaves_counters_alone() {
        let tracker = Tracker::new();
        tracker.run_tracked(|| crate::create_timer(Duration::ZERO, || {}));
        assert_eq!(tracker.state().pending_timers(), 0);
        EventLoop::current().run_until_idle();
    }

    #[test]
    fn test_tracked_timer_delays_async_done() {
        let tracker = Tracker::with_config(TrackerConfig::new().track_all_timers());
        let log = event_log(&tracker);

        tracker.run_tracked(|| crate::create_timer(Duration::from_millis(5), || {}));
        assert_eq!(*log.borrow(), vec!["begin", "end"]);
        assert_eq!(tracker.state().pending_timers(), 1);

        EventLoop::current().run_until_idle();
        assert_eq!(*log.borrow(), vec!["begin", "end", "begin", "end", "done"]);
    }

    #[test]
    fn test_cancelled_timer_releases_count_once() {
        let tracker = Tracker::with_config(TrackerConfig::new().track_all_timers());
        let log = event_log(&tracker);

        tracker.run_tracked(|| {
            let timer = crate::create_timer(Duration::from_secs(1), || {});
            timer.cancel();
            timer.cancel();
            assert!(!timer.is_active());
        });
        assert_eq!(tracker.state().pending_timers(), 0);
        assert_eq!(*log.borrow(), vec!["begin", "end", "done"]);
    }

    #[test]
    fn test_capture_errors_publishes_microtask_panic() {
        let tracker = Tracker::with_config(TrackerConfig::new().capture_errors());
        let log = event_log(&tracker);
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);
        tracker
            .on_error()
            .subscribe(move |error: &AsyncError| sink.borrow_mut().push(error.to_string()));

        tracker.run_tracked(|| crate::schedule_microtask(|| panic!("microtask failure")));
        EventLoop::current().run_microtasks();

        assert_eq!(*errors.borrow(), vec!["microtask failure".to_string()]);
        assert_eq!(*log.borrow(), vec!["begin", "end", "done"]);
    }

    #[test]
    fn test_uncaptured_error_escalates_after_counting_out() {
        let tracker = Tracker::new();
        tracker.run_tracked(|| crate::schedule_microtask(|| panic!("escalated")));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            EventLoop::current().run_microtasks();
        }));
        assert!(result.is_err());
        assert!(!tracker.in_turn());
        assert!(tracker.state().is_quiescent());
    }

    #[test]
    fn test_run_guarded_captures_sync_panic() {
        let tracker = Tracker::new();
        let errors = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&errors);
        tracker
            .on_error()
            .subscribe(move |error: &AsyncError| sink.borrow_mut().push(error.to_string()));

        let result: Option<()> = tracker.run_guarded(|| panic!("guarded"));
        assert!(result.is_none());
        assert_eq!(tracker.run_guarded(|| 5), Some(5));
        assert_eq!(*errors.borrow(), vec!["guarded".to_string()]);
        assert!(!tracker.in_turn());
    }

    #[test]
    fn test_run_guarded_captures_deferred_panic() {
        let tracker = Tracker::new();
        let count = Rc::new(Cell::new(0));
        let counter = Rc::clone(&count);
        tracker
            .on_error()
            .subscribe(move |_| counter.set(counter.get() + 1));

        tracker.run_guarded(|| crate::schedule_microtask(|| panic!("later")));
        assert!(tracker.in_turn());
        EventLoop::current().run_microtasks();

        assert_eq!(count.get(), 1);
        assert!(!tracker.in_turn());
    }

    #[test]
    fn test_long_stack_traces_attach_scheduling_site() {
        let tracker = Tracker::with_config(TrackerConfig::new().capture_errors().long_stack_traces());
        let traced = Rc::new(Cell::new(false));
        let flag = Rc::clone(&traced);
        tracker
            .on_error()
            .subscribe(move |error: &AsyncError| flag.set(error.trace().is_some()));

        tracker.run_tracked(|| crate::schedule_microtask(|| panic!("traced")));
        EventLoop::current().run_microtasks();
        assert!(traced.get());
    }

    #[test]
    fn test_for_current_reuses_live_tracker() {
        set_context_reuse(true);
        let first = Tracker::for_current(TrackerConfig::new());
        let second = Tracker::for_current(TrackerConfig::new());
        assert_eq!(first.context(), second.context());

        let other = Tracker::for_current(TrackerConfig::new().capture_errors());
        assert_ne!(first.context(), other.context());
    }
}
