//! Capability handle handed to tracked actions.

use std::fmt;

use super::Tracker;

/// Lets a tracked action move work in or out of its tracker.
///
/// `include` and `exclude` are passthroughs when the caller is already on
/// the requested side.
#[derive(Clone)]
pub struct TrackContext {
    tracker: Tracker,
}

impl TrackContext {
    pub(super) fn new(tracker: Tracker) -> Self {
        Self { tracker }
    }

    /// Runs `action` tracked.
    pub fn include<R>(&self, action: impl FnOnce() -> R) -> R {
        if self.tracker.is_tracking() {
            action()
        } else {
            self.tracker.run_tracked(action)
        }
    }

    /// Runs `action` untracked.
    pub fn exclude<R>(&self, action: impl FnOnce() -> R) -> R {
        if self.tracker.is_tracking() {
            self.tracker.run_excluded(action)
        } else {
            action()
        }
    }

    /// Returns `true` if the caller runs inside the tracked context.
    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.tracker.is_tracking()
    }

    /// The tracker behind this handle.
    #[must_use]
    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }
}

impl fmt::Debug for TrackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackContext")
            .field("context", &self.tracker.context().id())
            .field("is_tracking", &self.is_tracking())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::EventLoop;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_include_enters_tracking() {
        let tracker = Tracker::new();
        let track = tracker.track_context();

        assert!(!track.is_tracking());
        assert!(track.include(|| track.is_tracking()));
        assert!(!tracker.in_turn());
    }

    #[test]
    fn test_include_is_passthrough_when_tracking() {
        let tracker = Tracker::new();
        let track = tracker.track_context();

        tracker.run_tracked(|| {
            track.include(|| assert_eq!(tracker.state().nested_calls(), 1));
        });
    }

    #[test]
    fn test_exclude_is_passthrough_when_not_tracking() {
        let tracker = Tracker::new();
        let track = tracker.track_context();
        let depth = track.exclude(|| tracker.state().nested_calls());
        assert_eq!(depth, 0);
        assert!(!tracker.in_turn());
    }

    #[test]
    fn test_excluded_chain_runs_after_turn_end() {
        let tracker = Tracker::new();
        let track = tracker.track_context();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        tracker
            .on_turn_end()
            .subscribe(move |_| l.borrow_mut().push("turn end"));

        let l = Rc::clone(&log);
        tracker.run_tracked(|| {
            let chain = Rc::clone(&l);
            track.exclude(move || {
                crate::schedule_microtask(move || {
                    crate::schedule_microtask(move || chain.borrow_mut().push("excluded"));
                });
            });
            crate::schedule_microtask(move || l.borrow_mut().push("included"));
        });

        EventLoop::current().run_microtasks();
        assert_eq!(*log.borrow(), vec!["included", "turn end", "excluded"]);
    }
}
