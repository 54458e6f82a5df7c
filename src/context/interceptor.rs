//! Interception hooks for execution contexts.

use std::panic;
use std::rc::Rc;
use std::time::Duration;

use super::Context;
use crate::error::AsyncError;
use crate::scheduler::{EventLoop, Timer};

/// A unit of deferred work handed to the scheduler.
pub type Callback = Box<dyn FnOnce()>;

/// Hooks a forked [`Context`] installs over the scheduler's primitives.
///
/// Every method has a default that forwards to `parent`, so an interceptor
/// only overrides the operations it cares about. Hooks run synchronously,
/// inline with the dispatch they intercept.
///
/// `context` is the context the operation was requested on; it may be a
/// descendant of the context that installed the interceptor.
pub trait Interceptor {
    /// Synchronous call dispatch. Must invoke `parent.run(context, f)`
    /// exactly once.
    fn run(&self, parent: Delegate<'_>, context: &Context, f: &mut dyn FnMut()) {
        parent.run(context, f);
    }

    /// Microtask scheduling. `task` is already bound to `context`.
    fn schedule_microtask(&self, parent: Delegate<'_>, context: &Context, task: Callback) {
        parent.schedule_microtask(context, task);
    }

    /// Timer creation. `callback` is already bound to `context`.
    fn create_timer(
        &self,
        parent: Delegate<'_>,
        context: &Context,
        delay: Duration,
        callback: Callback,
    ) -> Timer {
        parent.create_timer(context, delay, callback)
    }

    /// An error escaped a callback running in `context`.
    fn handle_uncaught_error(&self, parent: Delegate<'_>, context: &Context, error: AsyncError) {
        parent.handle_uncaught_error(context, error);
    }
}

/// Forwards an intercepted operation to the next interceptor up the
/// context chain, or to the event loop once the chain is exhausted.
#[derive(Clone, Copy)]
pub struct Delegate<'a> {
    next: Option<&'a Context>,
}

impl<'a> Delegate<'a> {
    pub(crate) fn new(next: Option<&'a Context>) -> Self {
        Self { next }
    }

    /// Finds the nearest interceptor at or above `next`, paired with the
    /// delegate that continues past it.
    fn resolve(&self) -> Option<(&'a Rc<dyn Interceptor>, Delegate<'a>)> {
        let mut cursor = self.next;
        while let Some(context) = cursor {
            if let Some(interceptor) = context.interceptor() {
                return Some((interceptor, Delegate::new(context.parent())));
            }
            cursor = context.parent();
        }
        None
    }

    /// Runs `f` with `context` as the current context.
    pub fn run(&self, context: &Context, f: &mut dyn FnMut()) {
        match self.resolve() {
            Some((interceptor, parent)) => interceptor.run(parent, context, f),
            None => {
                let _entered = context.enter();
                f();
            }
        }
    }

    /// Queues `task` on the event loop's microtask queue.
    pub fn schedule_microtask(&self, context: &Context, task: Callback) {
        match self.resolve() {
            Some((interceptor, parent)) => interceptor.schedule_microtask(parent, context, task),
            None => EventLoop::current().push_microtask(task),
        }
    }

    /// Registers `callback` to fire after `delay` of virtual time.
    pub fn create_timer(&self, context: &Context, delay: Duration, callback: Callback) -> Timer {
        match self.resolve() {
            Some((interceptor, parent)) => interceptor.create_timer(parent, context, delay, callback),
            None => EventLoop::current().insert_timer(delay, callback),
        }
    }

    /// Reports `error`. With no interceptor left to handle it the error is
    /// re-raised as a panic on the caller's stack.
    pub fn handle_uncaught_error(&self, context: &Context, error: AsyncError) {
        match self.resolve() {
            Some((interceptor, parent)) => {
                interceptor.handle_uncaught_error(parent, context, error);
            }
            None => {
                tracing::debug!(context = %context.id(), %error, "uncaught error reached the root context");
                panic::resume_unwind(error.into_payload());
            }
        }
    }
}
