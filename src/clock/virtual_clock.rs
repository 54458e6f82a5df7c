use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PAUSED_MESSAGE: &str = "virtual clock is paused; resume it before advancing";

/// Elapsed virtual time on an [`EventLoop`](crate::scheduler::EventLoop).
///
/// Readings start at zero (or a chosen origin) and only move forward, either
/// when the loop jumps to the next timer deadline or when a caller advances
/// it. Clones observe the same reading.
///
/// A paused clock keeps its reading; timers that are not yet due stay queued
/// until it is resumed.
///
/// ```rust
/// use std::time::Duration;
/// use turnkit::clock::VirtualClock;
///
/// let clock = VirtualClock::new();
/// let observer = clock.clone();
///
/// clock.advance(Duration::from_millis(250));
/// assert_eq!(observer.now(), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    shared: Arc<Reading>,
}

#[derive(Debug, Default)]
struct Reading {
    nanos: AtomicU64,
    paused: AtomicBool,
}

fn to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl VirtualClock {
    /// A clock reading zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock whose first reading is `origin`.
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use turnkit::clock::VirtualClock;
    ///
    /// let clock = VirtualClock::starting_at(Duration::from_secs(60));
    /// assert_eq!(clock.now(), Duration::from_secs(60));
    /// ```
    #[must_use]
    pub fn starting_at(origin: Duration) -> Self {
        let clock = Self::default();
        clock.shared.nanos.store(to_nanos(origin), Ordering::SeqCst);
        clock
    }

    /// Current reading.
    #[must_use]
    pub fn now(&self) -> Duration {
        Duration::from_nanos(self.shared.nanos.load(Ordering::SeqCst))
    }

    /// Moves the reading forward by `step` without firing anything.
    ///
    /// [`EventLoop::advance`](crate::scheduler::EventLoop::advance) is the
    /// variant that also runs timers falling due along the way.
    ///
    /// # Panics
    ///
    /// Panics while the clock is paused.
    pub fn advance(&self, step: Duration) {
        assert!(!self.is_paused(), "{PAUSED_MESSAGE}");
        let _ = self
            .shared
            .nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |nanos| {
                Some(nanos.saturating_add(to_nanos(step)))
            });
    }

    /// Moves the reading to `deadline` if that is later than now.
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use turnkit::clock::VirtualClock;
    ///
    /// let clock = VirtualClock::new();
    /// clock.advance_to(Duration::from_millis(40));
    /// clock.advance_to(Duration::from_millis(15));
    /// assert_eq!(clock.now(), Duration::from_millis(40));
    /// ```
    ///
    /// # Panics
    ///
    /// Panics while the clock is paused.
    pub fn advance_to(&self, deadline: Duration) {
        assert!(!self.is_paused(), "{PAUSED_MESSAGE}");
        self.shared
            .nanos
            .fetch_max(to_nanos(deadline), Ordering::SeqCst);
    }

    /// Freezes the reading. The event loop stops jumping to future deadlines.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Lets the reading move again.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    /// Whether [`pause`](Self::pause) is in effect.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }
}
