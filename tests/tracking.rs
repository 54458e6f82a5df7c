//! End-to-end tracking scenarios on the thread's event loop.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use futures::StreamExt;
use turnkit::prelude::*;
use turnkit::scheduler::spawn;

type Log = Rc<RefCell<Vec<String>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup() -> EventLoop {
    init_tracing();
    turnkit::set_context_reuse(false);
    let event_loop = EventLoop::current();
    event_loop.reset();
    event_loop
}

fn push(log: &Log, entry: &str) {
    log.borrow_mut().push(entry.to_string());
}

/// Records every tracker event into a shared log.
fn record_events(tracker: &Tracker) -> Log {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let l = Rc::clone(&log);
    tracker.on_turn_begin().subscribe(move |_| push(&l, "begin"));
    let l = Rc::clone(&log);
    tracker.on_turn_end().subscribe(move |_| push(&l, "end"));
    let l = Rc::clone(&log);
    tracker.on_async_done().subscribe(move |_| push(&l, "done"));
    log
}

fn schedule_chain(log: Log, remaining: usize) {
    if remaining == 0 {
        return;
    }
    turnkit::schedule_microtask(move || {
        push(&log, &format!("microtask {remaining}"));
        schedule_chain(log, remaining - 1);
    });
}

#[test]
fn test_three_chained_microtasks_form_one_turn() {
    let event_loop = setup();
    let tracker = Tracker::new();
    let log = record_events(&tracker);

    tracker.run_tracked(|| schedule_chain(Rc::clone(&log), 3));
    assert_eq!(*log.borrow(), vec!["begin"]);

    event_loop.run_until_idle();
    assert_eq!(
        *log.borrow(),
        vec!["begin", "microtask 3", "microtask 2", "microtask 1", "end", "done"]
    );
}

#[test]
fn test_excluded_chain_observed_after_turn_end() {
    let event_loop = setup();
    let tracked = run_tracked(
        |track| {
            let log: Log = Rc::new(RefCell::new(Vec::new()));
            let end_log = Rc::clone(&log);
            track
                .tracker()
                .on_turn_end()
                .subscribe(move |_| push(&end_log, "turn end"));

            let excluded = track.clone();
            let chain = Rc::clone(&log);
            turnkit::schedule_microtask(move || {
                excluded.exclude(move || {
                    turnkit::schedule_microtask(move || {
                        push(&chain, "excluded 1");
                        turnkit::schedule_microtask(move || push(&chain, "excluded 2"));
                    });
                });
            });
            let included = Rc::clone(&log);
            turnkit::schedule_microtask(move || push(&included, "included"));
            log
        },
        RunOptions::new(),
    );

    let log = event_loop.block_on(tracked).unwrap().unwrap();
    event_loop.run_until_idle();
    assert_eq!(
        *log.borrow(),
        vec!["included", "turn end", "excluded 1", "excluded 2"]
    );
}

#[test]
fn test_sync_action_begins_then_ends() {
    let _event_loop = setup();
    let tracker = Tracker::new();
    let log = record_events(&tracker);

    assert_eq!(tracker.run_tracked(|| "sync"), "sync");
    assert_eq!(*log.borrow(), vec!["begin", "end", "done"]);
}

#[test]
fn test_zero_threshold_timer_holds_async_done() {
    let event_loop = setup();
    let tracker = Tracker::with_config(TrackerConfig::new().track_all_timers());
    let log = record_events(&tracker);

    let l = Rc::clone(&log);
    tracker.run_tracked(|| {
        turnkit::create_timer(Duration::from_millis(100), move || push(&l, "timer"));
    });
    assert_eq!(tracker.state().pending_timers(), 1);
    assert_eq!(*log.borrow(), vec!["begin", "end"]);

    event_loop.run_microtasks();
    assert_eq!(*log.borrow(), vec!["begin", "end"]);

    event_loop.advance(Duration::from_millis(100));
    assert_eq!(tracker.state().pending_timers(), 0);
    assert_eq!(
        *log.borrow(),
        vec!["begin", "end", "begin", "timer", "end", "done"]
    );
}

#[test]
fn test_timer_at_threshold_is_untracked() {
    let event_loop = setup();
    let tracker = Tracker::with_config(TrackerConfig::new().timer_threshold(Duration::from_millis(50)));
    let log = record_events(&tracker);

    tracker.run_tracked(|| {
        turnkit::create_timer(Duration::from_millis(50), || {});
        turnkit::create_timer(Duration::from_millis(10), || {});
    });
    assert_eq!(tracker.state().pending_timers(), 1);
    assert_eq!(*log.borrow(), vec!["begin", "end"]);

    event_loop.run_until_idle();
    assert_eq!(tracker.state().pending_timers(), 0);
    assert!(log.borrow().ends_with(&["done".to_string()]));
}

#[test]
fn test_microtask_error_captured_once() {
    #[derive(Debug)]
    struct Boom(u32);

    let event_loop = setup();
    let tracker = Tracker::with_config(TrackerConfig::new().capture_errors());
    let log = record_events(&tracker);
    let errors = Rc::new(Cell::new(0));
    let count = Rc::clone(&errors);
    let l = Rc::clone(&log);
    tracker.on_error().subscribe(move |error| {
        count.set(count.get() + 1);
        assert_eq!(error.downcast_ref::<Boom>().map(|boom| boom.0), Some(7));
        push(&l, "error");
    });

    tracker.run_tracked(|| {
        turnkit::schedule_microtask(|| std::panic::panic_any(Boom(7)));
    });
    event_loop.run_until_idle();

    assert_eq!(errors.get(), 1);
    assert_eq!(*log.borrow(), vec!["begin", "error", "end", "done"]);
    assert!(tracker.state().is_quiescent());
}

#[test]
fn test_timer_cancelled_between_turns_emits_nothing() {
    let event_loop = setup();
    let tracker = Tracker::with_config(TrackerConfig::new().track_all_timers());
    let log = record_events(&tracker);

    let timer = tracker.run_tracked(|| turnkit::create_timer(Duration::from_millis(40), || {}));
    assert_eq!(*log.borrow(), vec!["begin", "end"]);
    assert!(!tracker.in_turn());

    timer.cancel();
    assert_eq!(tracker.state().pending_timers(), 0);
    assert_eq!(*log.borrow(), vec!["begin", "end"]);
    assert!(event_loop.is_idle());

    tracker.run_tracked(|| ());
    assert_eq!(*log.borrow(), vec!["begin", "end", "begin", "end", "done"]);
}

#[test]
fn test_async_run_reports_side_errors_and_still_resolves() {
    let _event_loop = setup();
    let messages = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&messages);

    let tracked = run_tracked_async(
        |_| async {
            turnkit::schedule_microtask(|| panic!("side effect"));
            sleep(Duration::from_millis(10)).await;
            turnkit::schedule_microtask(|| panic!("later side effect"));
            sleep(Duration::from_millis(10)).await;
            5u8
        },
        RunOptions::new().on_error(move |error| sink.borrow_mut().push(error.to_string())),
    );
    let tracker = tracked.tracker().clone();

    assert_eq!(tracked.wait().unwrap(), 5);
    assert_eq!(
        *messages.borrow(),
        vec!["side effect".to_string(), "later side effect".to_string()]
    );
    assert_eq!(tracker.on_error().listener_count(), 0);
}

#[test]
fn test_turns_alternate_across_runs() {
    let event_loop = setup();
    let tracker = Tracker::with_config(TrackerConfig::new().track_all_timers());
    let log = record_events(&tracker);

    for delay in [0, 5, 10] {
        let t = tracker.clone();
        tracker.run_tracked(move || {
            turnkit::schedule_microtask(move || {
                t.run_tracked(|| turnkit::schedule_microtask(|| {}));
            });
            turnkit::create_timer(Duration::from_millis(delay), || {});
        });
    }
    event_loop.run_until_idle();

    let entries = log.borrow().clone();
    let boundaries: Vec<&str> = entries
        .iter()
        .map(String::as_str)
        .filter(|entry| *entry != "done")
        .collect();
    assert!(!boundaries.is_empty());
    for (index, entry) in boundaries.iter().enumerate() {
        let expected = if index % 2 == 0 { "begin" } else { "end" };
        assert_eq!(*entry, expected, "event {index} in {boundaries:?}");
    }
    assert_eq!(entries.last().map(String::as_str), Some("done"));
}

#[test]
fn test_spawned_future_is_tracked() {
    let event_loop = setup();
    let tracker = Tracker::with_config(TrackerConfig::new().track_all_timers());
    let log = record_events(&tracker);

    let l = Rc::clone(&log);
    let handle = tracker.run_tracked(|| {
        spawn(async move {
            sleep(Duration::from_millis(20)).await;
            push(&l, "woke");
            3
        })
    });
    assert!(tracker.in_turn());

    let output = event_loop.block_on(handle).unwrap();
    event_loop.run_until_idle();
    assert_eq!(output, Some(3));
    assert_eq!(log.borrow().first().map(String::as_str), Some("begin"));
    assert_eq!(log.borrow().last().map(String::as_str), Some("done"));
    assert!(log.borrow().contains(&"woke".to_string()));
    assert!(tracker.state().is_quiescent());
}

#[test]
fn test_aborted_task_releases_tracked_sleep() {
    let event_loop = setup();
    let tracker = Tracker::with_config(TrackerConfig::new().track_all_timers());

    let handle = tracker.run_tracked(|| spawn(sleep(Duration::from_secs(30))));
    event_loop.run_microtasks();
    assert_eq!(tracker.state().pending_timers(), 1);

    handle.abort();
    assert_eq!(tracker.state().pending_timers(), 0);
    assert!(event_loop.is_idle());
}

#[test]
fn test_turn_end_stream_counts_turns() {
    let event_loop = setup();
    let tracker = Tracker::new();
    let mut ends = tracker.on_turn_end().stream();

    for _ in 0..3 {
        tracker.run_tracked(|| turnkit::schedule_microtask(|| {}));
        event_loop.run_microtasks();
    }

    let collected = event_loop
        .block_on(async move {
            let mut count = 0;
            while count < 3 {
                if ends.next().await.is_none() {
                    break;
                }
                count += 1;
            }
            count
        })
        .unwrap();
    assert_eq!(collected, 3);
}

#[test]
fn test_one_shot_captures_action_failure() {
    let _event_loop = setup();
    let tracked: Tracked<u8> = run_tracked(
        |_| panic!("action failed"),
        RunOptions::new().on_error(|_| {}),
    );

    match tracked.wait() {
        Err(Error::ActionFailed(message)) => assert_eq!(message, "action failed"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_one_shot_without_handler_escalates() {
    let _event_loop = setup();
    let tracked = run_tracked(|_| -> u8 { panic!("escalates") }, RunOptions::new());

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| tracked.wait()));
    assert!(result.is_err());
}

#[test]
fn test_context_reuse_toggle() {
    let _event_loop = setup();

    let first = Tracker::for_current(TrackerConfig::new());
    let second = Tracker::for_current(TrackerConfig::new());
    assert_ne!(first.context(), second.context());
}
