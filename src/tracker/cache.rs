//! Reuse of live trackers per parent context.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{Tracker, TrackerConfig, TrackerShared};
use crate::context::{Context, ContextId, WeakContext};

static CONTEXT_REUSE: AtomicBool = AtomicBool::new(true);

thread_local! {
    static CACHE: RefCell<HashMap<(ContextId, TrackerConfig), Entry>> = RefCell::new(HashMap::new());
}

/// Weak handles to a tracker; the entry dies with the tracker.
struct Entry {
    context: WeakContext,
    shared: Weak<TrackerShared>,
}

impl Entry {
    fn upgrade(&self) -> Option<Tracker> {
        let context = self.context.upgrade()?;
        let shared = self.shared.upgrade()?;
        Some(Tracker::from_parts(shared, context))
    }
}

/// Enables or disables tracker reuse for the whole process.
///
/// Reuse is on by default. A reused tracker may already be mid-turn when it
/// is handed out, which makes turn boundaries depend on unrelated work;
/// tests that assert exact event sequences turn it off.
pub fn set_context_reuse(enabled: bool) {
    CONTEXT_REUSE.store(enabled, Ordering::SeqCst);
}

/// Returns `true` if [`Tracker::for_current`] may reuse trackers.
#[must_use]
pub fn context_reuse_enabled() -> bool {
    CONTEXT_REUSE.load(Ordering::SeqCst)
}

/// Forgets every tracker cached on this thread.
pub fn clear_context_cache() {
    CACHE.with(|cache| cache.borrow_mut().clear());
}

pub(super) fn lookup(parent: &Context, config: &TrackerConfig) -> Option<Tracker> {
    let entry = CACHE.with(|cache| {
        cache
            .borrow()
            .get(&(parent.id(), config.clone()))
            .and_then(Entry::upgrade)
    });
    if entry.is_some() {
        tracing::debug!(parent = %parent.id(), "reusing cached tracker");
    }
    entry
}

pub(super) fn store(parent: &Context, tracker: &Tracker) {
    CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.retain(|_, entry| entry.shared.strong_count() > 0);
        cache.insert(
            (parent.id(), tracker.config().clone()),
            Entry {
                context: tracker.context().downgrade(),
                shared: std::rc::Rc::downgrade(&tracker.shared),
            },
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_finds_live_tracker() {
        let parent = Context::root();
        let tracker = Tracker::with_config(TrackerConfig::new());
        store(&parent, &tracker);

        let found = lookup(&parent, &TrackerConfig::new()).unwrap();
        assert_eq!(found.context(), tracker.context());
        assert!(lookup(&parent, &TrackerConfig::new().capture_errors()).is_none());
    }

    #[test]
    fn test_entry_does_not_keep_tracker_alive() {
        let parent = Context::root();
        let tracker = Tracker::with_config(TrackerConfig::new());
        store(&parent, &tracker);
        drop(tracker);

        assert!(lookup(&parent, &TrackerConfig::new()).is_none());
    }

    #[test]
    fn test_clear_forgets_entries() {
        let parent = Context::root();
        let tracker = Tracker::with_config(TrackerConfig::new());
        store(&parent, &tracker);

        clear_context_cache();
        assert!(lookup(&parent, &TrackerConfig::new()).is_none());
    }
}
