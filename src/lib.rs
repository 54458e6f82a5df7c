//! # turnkit 🧭
//!
//! > Know when your async work has settled
//!
//! **turnkit** instruments a cooperative, single-threaded scheduler so you can
//! tell when a unit of work, and everything it transitively scheduled, has
//! finished running. Tests launch an operation and await the moment its
//! fallout has settled instead of guessing delays.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use turnkit::prelude::*;
//!
//! let log = Rc::new(RefCell::new(Vec::new()));
//! let l = Rc::clone(&log);
//!
//! let tracked = run_tracked(
//!     move |_| {
//!         let inner = Rc::clone(&l);
//!         turnkit::schedule_microtask(move || inner.borrow_mut().push("deferred"));
//!         l.borrow_mut().push("action");
//!     },
//!     RunOptions::new(),
//! );
//!
//! tracked.wait().unwrap();
//! assert_eq!(*log.borrow(), vec!["action", "deferred"]);
//! ```
//!
//! ## Features
//!
//! - 🔁 **Event loop** - Microtasks, virtual-time timers and `!Send` futures
//! - 🧩 **Contexts** - Forkable scheduling contexts with interceptors
//! - 🎯 **Turn tracking** - Turn-begin, turn-end and quiescence signals
//! - 💥 **Error capture** - Uncaught errors published instead of escalated
//! - 🧪 **Test macro** - `#[turnkit::test]` with an injected `Tracker`

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Virtual clock and timer queue
pub mod clock;

pub mod context;
pub mod error;
pub mod scheduler;
pub mod tracker;

/// Prelude for convenient imports
///
/// ```rust
/// use turnkit::prelude::*;
/// ```
pub mod prelude {
    pub use crate::context::Context;
    pub use crate::error::{AsyncError, Error, Result};
    pub use crate::scheduler::{sleep, timeout, EventLoop, TaskHandle, Timer};
    pub use crate::tracker::{
        run_tracked, run_tracked_async, RunOptions, TrackContext, Tracked, Tracker, TrackerConfig,
    };
}

// Re-exports
pub use error::{AsyncError, Error, Result};
pub use scheduler::{create_timer, schedule_microtask, spawn};
pub use tracker::{
    clear_context_cache, context_reuse_enabled, run_tracked, run_tracked_async,
    set_context_reuse, RunOptions, TrackContext, Tracked, Tracker, TrackerConfig,
};

// Re-export the test macro when macros feature is enabled
#[cfg(feature = "macros")]
pub use turnkit_macros::test;
