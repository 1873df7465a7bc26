//! Bounded wait helpers
//!
//! Every blocking wait in the session goes through these helpers so that
//! deadlines are computed once and spurious wakeups re-check the predicate.

use parking_lot::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

/// Wait on `condvar` until `done` holds or `timeout` elapses
///
/// Returns true if the predicate was satisfied. The predicate only sees
/// state protected by the guard, so a notification is required to make
/// progress.
pub fn wait_until<T, F>(
    guard: &mut MutexGuard<'_, T>,
    condvar: &Condvar,
    timeout: Duration,
    mut done: F,
) -> bool
where
    F: FnMut(&mut T) -> bool,
{
    let deadline = Instant::now() + timeout;
    while !done(guard) {
        if condvar.wait_until(guard, deadline).timed_out() {
            return done(guard);
        }
    }
    true
}

/// Like [`wait_until`], but also wakes every `poll` to re-evaluate
///
/// Used where the predicate depends on state outside the guarded value
/// (session state, pipeline node status) that changes without notifying
/// this condvar.
pub fn wait_until_polling<T, F>(
    guard: &mut MutexGuard<'_, T>,
    condvar: &Condvar,
    timeout: Duration,
    poll: Duration,
    mut done: F,
) -> bool
where
    F: FnMut(&mut T) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if done(guard) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let slice = (now + poll).min(deadline);
        condvar.wait_until(guard, slice);
    }
}
