//! Polling assertions for async tests.

use std::time::Duration;

use tokio::time::{Instant, interval};

/// How often [`assert_eventually`] re-checks its condition.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition held. The condition is checked once more
/// after the deadline, so a condition that becomes true exactly at the
/// deadline still counts.
///
/// ```no_run
/// use std::{sync::{Arc, atomic::{AtomicBool, Ordering}}, time::Duration};
/// use strata_test_utils::assert_eventually;
///
/// # async fn example() {
/// let done = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&done);
/// tokio::spawn(async move { flag.store(true, Ordering::SeqCst) });
/// assert!(assert_eventually(Duration::from_secs(1), || done.load(Ordering::SeqCst)).await);
/// # }
/// ```
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut ticks = interval(POLL_INTERVAL);
    while Instant::now() < deadline {
        ticks.tick().await;
        if condition() {
            return true;
        }
    }
    condition()
}
