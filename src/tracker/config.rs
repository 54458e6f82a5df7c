//! Tracker configuration.

use std::time::Duration;

/// Configuration for a [`Tracker`](super::Tracker).
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use turnkit::TrackerConfig;
///
/// let config = TrackerConfig::new()
///     .timer_threshold(Duration::from_millis(100))
///     .capture_errors();
///
/// assert!(config.tracks_timer(Duration::from_millis(10)));
/// assert!(!config.tracks_timer(Duration::from_millis(100)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TrackerConfig {
    /// Timers with a delay below this are tracked. `None` tracks no timers.
    pub timer_threshold: Option<Duration>,
    /// Publish uncaught errors on `on_error` instead of escalating them.
    pub capture_errors: bool,
    /// Attach a backtrace of the scheduling site to captured errors.
    pub long_stack_traces: bool,
}

impl TrackerConfig {
    /// Create a new default configuration: no timers tracked, errors
    /// escalate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track timers whose delay is below `threshold`.
    ///
    /// A threshold of zero tracks every timer.
    #[must_use]
    pub fn timer_threshold(mut self, threshold: Duration) -> Self {
        self.timer_threshold = Some(threshold);
        self
    }

    /// Track every timer regardless of delay.
    #[must_use]
    pub fn track_all_timers(self) -> Self {
        self.timer_threshold(Duration::ZERO)
    }

    /// Capture uncaught errors on the tracker's error channel.
    #[must_use]
    pub fn capture_errors(mut self) -> Self {
        self.capture_errors = true;
        self
    }

    /// Record where callbacks were scheduled.
    #[must_use]
    pub fn long_stack_traces(mut self) -> Self {
        self.long_stack_traces = true;
        self
    }

    /// Returns `true` if a timer with `delay` counts as in-flight work.
    #[must_use]
    pub fn tracks_timer(&self, delay: Duration) -> bool {
        match self.timer_threshold {
            None => false,
            Some(threshold) if threshold.is_zero() => true,
            Some(threshold) => delay < threshold,
        }
    }
}
