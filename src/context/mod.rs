//! Execution contexts
//!
//! A [`Context`] is an isolated fork of the scheduler. Work started inside a
//! context (calls, microtasks, timers, spawned futures) stays bound to it, and
//! every primitive operation is routed through the [`Interceptor`]s installed
//! along the context's ancestry before it reaches the
//! [`EventLoop`](crate::scheduler::EventLoop).
//!
//! # Example
//!
//! ```rust
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use turnkit::context::{Context, Delegate, Interceptor};
//! use turnkit::scheduler::EventLoop;
//!
//! struct CountCalls(Rc<Cell<usize>>);
//!
//! impl Interceptor for CountCalls {
//!     fn run(&self, parent: Delegate<'_>, context: &Context, f: &mut dyn FnMut()) {
//!         self.0.set(self.0.get() + 1);
//!         parent.run(context, f);
//!     }
//! }
//!
//! let calls = Rc::new(Cell::new(0));
//! let context = Context::current().fork(CountCalls(Rc::clone(&calls)));
//!
//! context.run(|| turnkit::schedule_microtask(|| {}));
//! EventLoop::current().run_microtasks();
//!
//! // Once for `run`, once for the microtask executing inside the context.
//! assert_eq!(calls.get(), 2);
//! ```

mod interceptor;

pub use interceptor::{Callback, Delegate, Interceptor};

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::AsyncError;
use crate::scheduler::Timer;

/// Unique identifier of a [`Context`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({})", self.0)
    }
}

thread_local! {
    static ROOT: Context = Context::new_root();
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// An isolated scheduling context.
///
/// Cloning is cheap; clones refer to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

struct ContextInner {
    id: ContextId,
    parent: Option<Context>,
    interceptor: Option<Rc<dyn Interceptor>>,
}

impl Context {
    fn new_root() -> Self {
        Self {
            inner: Rc::new(ContextInner {
                id: ContextId::next(),
                parent: None,
                interceptor: None,
            }),
        }
    }

    /// The root context of this thread. It intercepts nothing.
    #[must_use]
    pub fn root() -> Self {
        ROOT.with(Clone::clone)
    }

    /// The context the calling code is executing in.
    #[must_use]
    pub fn current() -> Self {
        CURRENT
            .with(|current| current.borrow().clone())
            .unwrap_or_else(Self::root)
    }

    /// Creates a child context whose operations pass through `interceptor`
    /// before reaching this context's own interceptors.
    #[must_use]
    pub fn fork(&self, interceptor: impl Interceptor + 'static) -> Context {
        Self {
            inner: Rc::new(ContextInner {
                id: ContextId::next(),
                parent: Some(self.clone()),
                interceptor: Some(Rc::new(interceptor)),
            }),
        }
    }

    /// Returns this context's identifier.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Returns the context this one was forked from.
    #[must_use]
    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    /// Returns `true` for a thread's root context.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    /// Returns `true` if this context is `other` or was forked (directly or
    /// transitively) from it.
    #[must_use]
    pub fn is_within(&self, other: &Context) -> bool {
        let mut cursor = Some(self);
        while let Some(context) = cursor {
            if context == other {
                return true;
            }
            cursor = context.parent();
        }
        false
    }

    /// Creates a weak handle that does not keep the context alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Runs `f` inside this context and returns its result.
    ///
    /// # Panics
    ///
    /// Panics if an interceptor swallows the call instead of forwarding it to
    /// its delegate. Panics raised by `f` propagate to the caller.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let mut f = Some(f);
        let mut output = None;
        {
            let mut call = || {
                if let Some(f) = f.take() {
                    output = Some(f());
                }
            };
            Delegate::new(Some(self)).run(self, &mut call);
        }
        match output {
            Some(output) => output,
            None => panic!("an interceptor of {} did not forward `run`", self.id()),
        }
    }

    /// Runs `f(arg)` inside this context.
    pub fn run_unary<A, R>(&self, f: impl FnOnce(A) -> R, arg: A) -> R {
        self.run(move || f(arg))
    }

    /// Runs `f(first, second)` inside this context.
    pub fn run_binary<A, B, R>(&self, f: impl FnOnce(A, B) -> R, first: A, second: B) -> R {
        self.run(move || f(first, second))
    }

    /// Runs `f` inside this context, turning a panic into an uncaught error
    /// reported to this context.
    ///
    /// Returns `None` if `f` panicked and an interceptor handled the error.
    /// When nothing handles it, the panic resumes on the caller's stack.
    pub fn run_guarded<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run(f))) {
            Ok(output) => Some(output),
            Err(payload) => {
                self.handle_uncaught_error(AsyncError::from_panic(payload));
                None
            }
        }
    }

    /// Queues `f` as a microtask that will run inside this context.
    pub fn schedule_microtask(&self, f: impl FnOnce() + 'static) {
        let task = self.bind(f);
        Delegate::new(Some(self)).schedule_microtask(self, task);
    }

    /// Registers `f` to run inside this context after `delay` of virtual
    /// time.
    pub fn create_timer(&self, delay: Duration, f: impl FnOnce() + 'static) -> Timer {
        let callback = self.bind(f);
        Delegate::new(Some(self)).create_timer(self, delay, callback)
    }

    /// Routes `error` through this context's uncaught-error hooks.
    pub fn handle_uncaught_error(&self, error: AsyncError) {
        Delegate::new(Some(self)).handle_uncaught_error(self, error);
    }

    /// Reports an arbitrary error value as uncaught in this context.
    pub fn report_error<E: Any + Send>(&self, error: E) {
        self.handle_uncaught_error(AsyncError::new(error));
    }

    /// Wraps `f` so it runs guarded inside this context.
    fn bind(&self, f: impl FnOnce() + 'static) -> Callback {
        let context = self.clone();
        Box::new(move || {
            context.run_guarded(f);
        })
    }

    /// Makes this the current context until the guard is dropped.
    fn enter(&self) -> EnterGuard {
        let previous = CURRENT.with(|current| current.replace(Some(self.clone())));
        EnterGuard { previous }
    }

    fn interceptor(&self) -> Option<&Rc<dyn Interceptor>> {
        self.inner.interceptor.as_ref()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("parent", &self.parent().map(Context::id))
            .field("intercepted", &self.inner.interceptor.is_some())
            .finish()
    }
}

/// Restores the previously current context.
struct EnterGuard {
    previous: Option<Context>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CURRENT.try_with(|current| current.replace(previous));
    }
}

/// A weak reference to a [`Context`].
#[derive(Clone)]
pub struct WeakContext {
    inner: Weak<ContextInner>,
}

impl WeakContext {
    /// Returns the context if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Context> {
        self.inner.upgrade().map(|inner| Context { inner })
    }
}

impl fmt::Debug for WeakContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakContext")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
