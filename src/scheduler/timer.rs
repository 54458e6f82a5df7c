//! Timer handles.

use std::fmt;
use std::rc::{Rc, Weak};

use super::LoopInner;
use crate::clock::TimerId;

/// Cancellation and status for a registered timer.
///
/// Implemented by the event loop's own timers and by interceptors that wrap
/// them.
pub trait TimerControl {
    /// Prevents the timer from firing. Has no effect once it fired.
    fn cancel(&self);

    /// Returns `true` while the timer is still waiting to fire.
    fn is_active(&self) -> bool;
}

/// Handle to a timer created with
/// [`Context::create_timer`](crate::context::Context::create_timer).
#[derive(Clone)]
pub struct Timer {
    control: Rc<dyn TimerControl>,
}

impl Timer {
    /// Wraps a timer implementation.
    pub fn new(control: impl TimerControl + 'static) -> Self {
        Self {
            control: Rc::new(control),
        }
    }

    /// Cancels the timer.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Returns `true` while the timer is still waiting to fire.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.control.is_active()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A timer living in the event loop's timer queue.
pub(super) struct HostTimer {
    pub(super) id: TimerId,
    pub(super) event_loop: Weak<LoopInner>,
}

impl TimerControl for HostTimer {
    fn cancel(&self) {
        if let Some(inner) = self.event_loop.upgrade() {
            let removed = inner.timers.borrow_mut().cancel(self.id);
            if removed.is_some() {
                tracing::trace!(timer = %self.id, "timer cancelled");
            }
        }
    }

    fn is_active(&self) -> bool {
        let Some(inner) = self.event_loop.upgrade() else {
            return false;
        };
        let active = inner.timers.borrow().contains(self.id);
        active
    }
}
