use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Locks the mutex, recovering the guard if another thread panicked while
/// holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Waits on the condition variable until `done` returns true or the
/// deadline passes. Returns the guard along with the final check result.
pub(crate) fn wait_until<'a, T, F>(
    cond: &Condvar,
    mut guard: MutexGuard<'a, T>,
    timeout: Duration,
    mut done: F,
) -> (MutexGuard<'a, T>, bool)
where
    F: FnMut(&mut T) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if done(&mut guard) {
            return (guard, true);
        }
        let now = Instant::now();
        if now >= deadline {
            return (guard, false);
        }
        guard = match cond.wait_timeout(guard, deadline - now) {
            Ok((g, _)) => g,
            Err(e) => e.into_inner().0,
        };
    }
}

/// Waits on the condition variable for as long as `done` returns false.
pub(crate) fn wait_for<'a, T, F>(
    cond: &Condvar,
    mut guard: MutexGuard<'a, T>,
    mut done: F,
) -> MutexGuard<'a, T>
where
    F: FnMut(&mut T) -> bool,
{
    while !done(&mut guard) {
        guard = cond.wait(guard).unwrap_or_else(|e| e.into_inner());
    }
    guard
}
