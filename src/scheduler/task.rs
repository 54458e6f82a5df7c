//! Spawned futures.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Wake, Waker};
use std::thread::ThreadId;

use parking_lot::Mutex;

use super::EventLoop;
use crate::context::Context;

/// Unique identifier for a spawned task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Creates a new unique task ID.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Type-erased local future.
pub(crate) type LocalBoxFuture = Pin<Box<dyn Future<Output = ()>>>;

/// A spawned task as stored by the event loop.
pub(crate) struct TaskSlot {
    /// Context the task was spawned in; every poll runs inside it.
    pub context: Context,
    /// `None` while the task is being polled.
    pub future: Option<LocalBoxFuture>,
    /// A poll microtask is already queued.
    pub scheduled: bool,
}

struct JoinState<T> {
    output: Option<T>,
    finished: bool,
    waker: Option<Waker>,
}

fn finish<T>(state: &RefCell<JoinState<T>>, output: Option<T>) {
    let waker = {
        let mut state = state.borrow_mut();
        if state.finished {
            return;
        }
        state.output = output;
        state.finished = true;
        state.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}

/// Finishes the join state with no output if the task is dropped before
/// completing (aborted, or its poll panicked).
pub(crate) struct JoinGuard<T> {
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> JoinGuard<T> {
    pub(crate) fn complete(self, output: T) {
        finish(&self.state, Some(output));
    }
}

impl<T> Drop for JoinGuard<T> {
    fn drop(&mut self) {
        finish(&self.state, None);
    }
}

/// Creates the shared join state for a new task.
pub(crate) fn join_pair<T>(id: TaskId) -> (JoinGuard<T>, TaskHandle<T>) {
    let state = Rc::new(RefCell::new(JoinState {
        output: None,
        finished: false,
        waker: None,
    }));
    (
        JoinGuard {
            state: Rc::clone(&state),
        },
        TaskHandle { id, state },
    )
}

/// Handle to a spawned task.
///
/// Awaiting the handle yields `Some(output)` once the task completes, or
/// `None` if it was aborted or panicked.
pub struct TaskHandle<T> {
    /// The task's unique identifier.
    pub id: TaskId,
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> TaskHandle<T> {
    /// Returns true once the task completed, was aborted, or panicked.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }

    /// Takes the output if the task has completed.
    ///
    /// Returns `None` if the task hasn't completed yet or the output was
    /// already taken.
    #[must_use]
    pub fn take(&self) -> Option<T> {
        self.state.borrow_mut().output.take()
    }

    /// Drops the task's future. Timers it was waiting on are cancelled as
    /// part of the drop.
    pub fn abort(&self) {
        EventLoop::current().abort_task(self.id);
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let mut state = self.state.borrow_mut();
        if state.finished {
            Poll::Ready(state.output.take())
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("is_finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

/// Waker that re-schedules a task's poll through the task's context.
///
/// Wakes from the loop's own thread are scheduled immediately; wakes from any
/// other thread are queued and picked up on the loop's next step.
pub(crate) struct TaskWaker {
    pub id: TaskId,
    pub owner: ThreadId,
    pub remote: Arc<Mutex<Vec<TaskId>>>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if std::thread::current().id() == self.owner {
            if let Some(event_loop) = EventLoop::try_current() {
                event_loop.schedule_poll(self.id);
                return;
            }
        }
        self.remote.lock().push(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_unique() {
        let id1 = TaskId::new();
        let id2 = TaskId::new();
        assert_ne!(id1, id2);
        assert!(id1 < id2);
    }

    #[test]
    fn test_task_id_display() {
        let id = TaskId(7);
        assert_eq!(id.to_string(), "Task(7)");
    }

    #[test]
    fn test_join_guard_complete() {
        let (guard, handle) = join_pair::<i32>(TaskId::new());
        assert!(!handle.is_finished());

        guard.complete(42);
        assert!(handle.is_finished());
        assert_eq!(handle.take(), Some(42));
        assert!(handle.take().is_none());
    }

    #[test]
    fn test_join_guard_dropped_finishes_empty() {
        let (guard, handle) = join_pair::<i32>(TaskId::new());
        drop(guard);
        assert!(handle.is_finished());
        assert!(handle.take().is_none());
    }

    #[test]
    fn test_handle_future_wakes_on_completion() {
        use std::sync::atomic::AtomicBool;

        struct Flag(AtomicBool);
        impl Wake for Flag {
            fn wake(self: Arc<Self>) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let (guard, mut handle) = join_pair::<&str>(TaskId::new());
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let waker = Waker::from(Arc::clone(&flag));
        let mut cx = TaskContext::from_waker(&waker);

        assert!(Pin::new(&mut handle).poll(&mut cx).is_pending());
        guard.complete("done");
        assert!(flag.0.load(Ordering::SeqCst));
        assert_eq!(Pin::new(&mut handle).poll(&mut cx), Poll::Ready(Some("done")));
    }
}
