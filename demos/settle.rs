//! Runs a small piece of async work under a tracker and reports each turn.
//!
//! ```text
//! RUST_LOG=turnkit=trace cargo run --example settle
//! ```

use std::time::Duration;

use tracing::info;
use turnkit::prelude::*;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let event_loop = EventLoop::current();
    let tracker = Tracker::with_config(TrackerConfig::new().timer_threshold(Duration::from_millis(100)));

    tracker
        .on_turn_begin()
        .subscribe(|_| info!(now = ?EventLoop::current().now(), "turn begin"));
    tracker
        .on_turn_end()
        .subscribe(|_| info!(now = ?EventLoop::current().now(), "turn end"));
    tracker
        .on_async_done()
        .subscribe(|_| info!(now = ?EventLoop::current().now(), "settled"));

    tracker.run_tracked(|| {
        turnkit::schedule_microtask(|| info!("microtask"));
        turnkit::create_timer(Duration::from_millis(40), || info!("short timer"));
        turnkit::create_timer(Duration::from_secs(5), || info!("long timer (untracked)"));
        let _task = turnkit::spawn(async {
            sleep(Duration::from_millis(70)).await;
            info!("task woke");
        });
    });

    let steps = event_loop.run_until_idle();
    info!(steps, now = ?event_loop.now(), "event loop idle");
}
