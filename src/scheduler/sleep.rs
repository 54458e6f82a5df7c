//! Sleep and timeout futures on virtual time.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Duration;

use pin_project_lite::pin_project;

use super::Timer;
use crate::context::Context;
use crate::error::{Error, Result};

#[derive(Default)]
struct SleepState {
    fired: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

/// A future that completes after `delay` of virtual time.
///
/// The underlying timer is created on first poll, in the context that polls
/// it, so a sleep awaited inside a tracked task is a tracked timer. Dropping
/// an unfinished `Sleep` cancels its timer.
///
/// Created by [`sleep`].
#[derive(Debug)]
pub struct Sleep {
    delay: Duration,
    state: Rc<SleepState>,
    timer: Option<Timer>,
}

impl std::fmt::Debug for SleepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SleepState")
            .field("fired", &self.fired.get())
            .finish_non_exhaustive()
    }
}

/// Creates a [`Sleep`] future.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use turnkit::scheduler::{sleep, EventLoop};
///
/// let event_loop = EventLoop::current();
/// let start = event_loop.now();
///
/// event_loop.block_on(sleep(Duration::from_secs(5))).unwrap();
/// assert_eq!(event_loop.now() - start, Duration::from_secs(5));
/// ```
#[must_use]
pub fn sleep(delay: Duration) -> Sleep {
    Sleep {
        delay,
        state: Rc::new(SleepState::default()),
        timer: None,
    }
}

impl Sleep {
    /// The delay this sleep was created with.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Returns `true` once the timer has fired.
    #[must_use]
    pub fn is_elapsed(&self) -> bool {
        self.state.fired.get()
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        if self.state.fired.get() {
            return Poll::Ready(());
        }
        *self.state.waker.borrow_mut() = Some(cx.waker().clone());

        if self.timer.is_none() {
            let state = Rc::clone(&self.state);
            let timer = Context::current().create_timer(self.delay, move || {
                state.fired.set(true);
                let waker = state.waker.borrow_mut().take();
                if let Some(waker) = waker {
                    waker.wake();
                }
            });
            self.timer = Some(timer);
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            if timer.is_active() {
                timer.cancel();
            }
        }
    }
}

pin_project! {
    /// A future that fails with [`Error::Timeout`] if the inner future does
    /// not complete within a span of virtual time.
    ///
    /// Created by [`timeout`].
    #[derive(Debug)]
    pub struct Timeout<F> {
        #[pin]
        future: F,
        delay: Sleep,
    }
}

/// Requires `future` to complete within `duration` of virtual time.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use turnkit::scheduler::{sleep, timeout, EventLoop};
/// use turnkit::Error;
///
/// let event_loop = EventLoop::current();
/// let slow = sleep(Duration::from_secs(60));
/// let result = event_loop
///     .block_on(timeout(Duration::from_secs(1), slow))
///     .unwrap();
///
/// assert!(matches!(result, Err(Error::Timeout(_))));
/// ```
pub fn timeout<F: Future>(duration: Duration, future: F) -> Timeout<F> {
    Timeout {
        future,
        delay: sleep(duration),
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(output) = this.future.poll(cx) {
            return Poll::Ready(Ok(output));
        }
        match Pin::new(&mut *this.delay).poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(Error::Timeout(this.delay.delay()))),
            Poll::Pending => Poll::Pending,
        }
    }
}
