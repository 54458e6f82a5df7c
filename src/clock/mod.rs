//! Virtual time.
//!
//! Every [`EventLoop`](crate::scheduler::EventLoop) owns a [`VirtualClock`]
//! and a [`TimerQueue`]. Timer deadlines are readings of that clock, so a
//! test that sleeps for an hour finishes as soon as the loop has nothing
//! earlier to do.

mod timer_queue;
mod virtual_clock;

pub use timer_queue::{TimerId, TimerQueue};
pub use virtual_clock::VirtualClock;
