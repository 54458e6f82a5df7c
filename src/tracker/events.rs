//! Synchronous broadcast channels.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context as TaskContext, Poll, Waker};

use futures_core::Stream;

type Listener<T> = Rc<dyn Fn(&T)>;

/// A broadcast channel whose listeners are invoked synchronously, in
/// registration order, at the moment an event is emitted.
///
/// Listeners may subscribe or unsubscribe (themselves or others) while being
/// notified: emission works on a snapshot of the listener list, and a
/// listener removed mid-emission is not called.
///
/// # Example
///
/// ```rust
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use turnkit::tracker::EventChannel;
///
/// let channel = EventChannel::new();
/// let total = Rc::new(Cell::new(0));
///
/// let sum = Rc::clone(&total);
/// let subscription = channel.subscribe(move |n: &i32| sum.set(sum.get() + n));
///
/// channel.emit(&2);
/// channel.emit(&3);
/// subscription.unsubscribe();
/// channel.emit(&100);
///
/// assert_eq!(total.get(), 5);
/// ```
pub struct EventChannel<T> {
    inner: Rc<ChannelInner<T>>,
}

struct ChannelInner<T> {
    listeners: RefCell<Vec<(u64, Listener<T>)>>,
    next_id: Cell<u64>,
}

impl<T: 'static> EventChannel<T> {
    /// Creates a channel with no listeners.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ChannelInner {
                listeners: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
            }),
        }
    }

    /// Registers `listener` for every future event.
    pub fn subscribe(&self, listener: impl Fn(&T) + 'static) -> Subscription {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        self.inner
            .listeners
            .borrow_mut()
            .push((id, Rc::new(listener)));

        let weak: Weak<ChannelInner<T>> = Rc::downgrade(&self.inner);
        let channel: Weak<dyn Detach> = weak;
        Subscription { channel, id }
    }

    /// Registers `listener` for the next event only.
    pub fn once(&self, listener: impl FnOnce(&T) + 'static) -> Subscription {
        let slot = RefCell::new(Some(listener));
        let subscription = Rc::new(Cell::new(None::<Subscription>));
        let handle = Rc::clone(&subscription);

        let registered = self.subscribe(move |event| {
            if let Some(subscription) = handle.take() {
                subscription.unsubscribe();
            }
            let listener = slot.borrow_mut().take();
            if let Some(listener) = listener {
                listener(event);
            }
        });
        subscription.set(Some(registered.clone()));
        registered
    }

    /// Delivers `event` to every current listener.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<(u64, Listener<T>)> = self.inner.listeners.borrow().clone();
        for (id, listener) in snapshot {
            if self.inner.contains(id) {
                listener(event);
            }
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }
}

impl<T: Clone + 'static> EventChannel<T> {
    /// Returns a future resolving to the next event emitted after this call.
    pub fn next(&self) -> NextEvent<T> {
        let state = Rc::new(RefCell::new(Pending::default()));
        let sink = Rc::clone(&state);
        let subscription = self.once(move |event: &T| {
            let waker = {
                let mut sink = sink.borrow_mut();
                sink.value = Some(event.clone());
                sink.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        });
        NextEvent {
            state,
            subscription,
        }
    }

    /// Returns a stream of every event emitted after this call.
    ///
    /// Events are buffered until polled. The stream ends when the channel is
    /// dropped.
    pub fn stream(&self) -> EventStream<T> {
        let state = Rc::new(RefCell::new(Buffered::default()));
        let sink = Rc::clone(&state);
        let subscription = self.subscribe(move |event: &T| {
            let waker = {
                let mut sink = sink.borrow_mut();
                sink.queue.push_back(event.clone());
                sink.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        });
        EventStream {
            state,
            subscription,
        }
    }
}

impl<T: 'static> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("listeners", &self.inner.listeners.borrow().len())
            .finish()
    }
}

trait Detach {
    fn detach(&self, id: u64);
    fn contains(&self, id: u64) -> bool;
}

impl<T> Detach for ChannelInner<T> {
    fn detach(&self, id: u64) {
        let removed = {
            let mut listeners = self.listeners.borrow_mut();
            listeners
                .iter()
                .position(|(listener_id, _)| *listener_id == id)
                .map(|index| listeners.remove(index))
        };
        // Dropped outside the borrow: the listener may own another subscription.
        drop(removed);
    }

    fn contains(&self, id: u64) -> bool {
        self.listeners
            .borrow()
            .iter()
            .any(|(listener_id, _)| *listener_id == id)
    }
}

/// A listener registration. Dropping it does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe).
#[derive(Clone)]
pub struct Subscription {
    channel: Weak<dyn Detach>,
    id: u64,
}

impl Subscription {
    /// Removes the listener. Does nothing if it was already removed.
    pub fn unsubscribe(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.detach(self.id);
        }
    }

    /// Returns `true` while the listener is registered on a live channel.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.channel
            .upgrade()
            .is_some_and(|channel| channel.contains(self.id))
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

struct Pending<T> {
    value: Option<T>,
    waker: Option<Waker>,
}

impl<T> Default for Pending<T> {
    fn default() -> Self {
        Self {
            value: None,
            waker: None,
        }
    }
}

/// Future returned by [`EventChannel::next`].
///
/// The listener is registered when the future is created, so an event
/// emitted before the first poll is not missed.
#[must_use = "futures do nothing unless polled"]
pub struct NextEvent<T> {
    state: Rc<RefCell<Pending<T>>>,
    subscription: Subscription,
}

impl<T> Future for NextEvent<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<T> {
        let mut state = self.state.borrow_mut();
        match state.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for NextEvent<T> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl<T> fmt::Debug for NextEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextEvent")
            .field("ready", &self.state.borrow().value.is_some())
            .finish()
    }
}

struct Buffered<T> {
    queue: VecDeque<T>,
    waker: Option<Waker>,
}

impl<T> Default for Buffered<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            waker: None,
        }
    }
}

/// Stream returned by [`EventChannel::stream`].
#[must_use = "streams do nothing unless polled"]
pub struct EventStream<T> {
    state: Rc<RefCell<Buffered<T>>>,
    subscription: Subscription,
}

impl<T> EventStream<T> {
    /// Number of events received but not yet yielded.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.state.borrow().queue.len()
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<T>> {
        let mut state = self.state.borrow_mut();
        if let Some(event) = state.queue.pop_front() {
            return Poll::Ready(Some(event));
        }
        if !self.subscription.is_active() {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> Drop for EventStream<T> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl<T> fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("buffered", &self.buffered())
            .field("active", &self.subscription.is_active())
            .finish()
    }
}
