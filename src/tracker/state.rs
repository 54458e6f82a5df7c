//! In-flight work counters and the turn transition rule.

/// Snapshot of a tracker's in-flight work.
///
/// Counters only change through the tracking hooks. After every change the
/// tracker calls [`evaluate`](Self::evaluate) and applies the transition it
/// returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackerState {
    in_turn: bool,
    nested_calls: usize,
    pending_microtasks: usize,
    pending_timers: usize,
}

/// A change of turn state derived from the counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The first call entered the tracked context.
    TurnBegin,
    /// No calls or microtasks remain. `quiescent` is set when no tracked
    /// timers remain either.
    TurnEnd {
        /// No tracked timers are outstanding.
        quiescent: bool,
    },
}

impl TrackerState {
    /// Returns `true` between a turn-begin and its matching turn-end.
    #[must_use]
    pub fn in_turn(&self) -> bool {
        self.in_turn
    }

    /// Number of tracked calls currently on the stack.
    #[must_use]
    pub fn nested_calls(&self) -> usize {
        self.nested_calls
    }

    /// Number of tracked microtasks queued but not yet finished.
    #[must_use]
    pub fn pending_microtasks(&self) -> usize {
        self.pending_microtasks
    }

    /// Number of tracked timers neither fired nor cancelled.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.pending_timers
    }

    /// Returns `true` when nothing tracked is in flight.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.nested_calls == 0 && self.pending_microtasks == 0 && self.pending_timers == 0
    }

    /// Applies the transition rule to the current counters.
    ///
    /// Only the current values are consulted, so calling this again without
    /// a counter change returns `None`.
    pub(crate) fn evaluate(&mut self) -> Option<Transition> {
        if !self.in_turn && self.nested_calls > 0 {
            self.in_turn = true;
            return Some(Transition::TurnBegin);
        }
        if self.in_turn && self.nested_calls == 0 && self.pending_microtasks == 0 {
            self.in_turn = false;
            return Some(Transition::TurnEnd {
                quiescent: self.pending_timers == 0,
            });
        }
        None
    }

    pub(crate) fn enter_call(&mut self) {
        self.nested_calls += 1;
    }

    pub(crate) fn exit_call(&mut self) {
        debug_assert!(self.nested_calls > 0, "call exit without matching entry");
        self.nested_calls = self.nested_calls.saturating_sub(1);
    }

    pub(crate) fn microtask_scheduled(&mut self) {
        self.pending_microtasks += 1;
    }

    pub(crate) fn microtask_finished(&mut self) {
        debug_assert!(self.pending_microtasks > 0, "microtask finished twice");
        self.pending_microtasks = self.pending_microtasks.saturating_sub(1);
    }

    pub(crate) fn timer_created(&mut self) {
        self.pending_timers += 1;
    }

    pub(crate) fn timer_finished(&mut self) {
        debug_assert!(self.pending_timers > 0, "timer completed twice");
        self.pending_timers = self.pending_timers.saturating_sub(1);
    }
}
