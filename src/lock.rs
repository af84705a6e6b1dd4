//! Sleepable locks.
//!
//! A `SleepableLock` pairs a mutex with a condition variable so a guard can
//! `sleep()` until another thread calls `wakeup()`. `reacquire_after` runs a
//! closure with the lock released, for I/O that must not happen under it.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Mutual exclusion lock whose guards can sleep.
pub struct SleepableLock<T> {
    mutex: Mutex<T>,
    cond: Condvar,
}

/// Guards of `SleepableLock<T>`. These guards can `sleep()`/`wakeup()`.
pub struct SleepableLockGuard<'s, T> {
    lock: &'s SleepableLock<T>,
    // Always `Some` except transiently inside `sleep`/`reacquire_after`.
    guard: Option<MutexGuard<'s, T>>,
}

impl<T> SleepableLock<T> {
    /// Returns a new `SleepableLock` holding `data`.
    pub const fn new(data: T) -> Self {
        Self {
            mutex: Mutex::new(data),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> SleepableLockGuard<'_, T> {
        let guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        SleepableLockGuard {
            lock: self,
            guard: Some(guard),
        }
    }

    pub fn into_inner(self) -> T {
        self.mutex
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> SleepableLockGuard<'_, T> {
    /// Releases the lock and sleeps until some guard of the same lock calls
    /// `wakeup`. The lock is held again when this returns.
    pub fn sleep(&mut self) {
        let guard = self.guard.take().expect("sleep: guard");
        let guard = self
            .lock
            .cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner);
        self.guard = Some(guard);
    }

    /// Like `sleep`, but returns after at most `dur` even without a wakeup.
    /// Returns true if the wait timed out.
    pub fn sleep_timeout(&mut self, dur: Duration) -> bool {
        let guard = self.guard.take().expect("sleep_timeout: guard");
        let (guard, timeout) = self
            .lock
            .cond
            .wait_timeout(guard, dur)
            .unwrap_or_else(PoisonError::into_inner);
        self.guard = Some(guard);
        timeout.timed_out()
    }

    /// Wakes every guard sleeping on this lock.
    pub fn wakeup(&self) {
        self.lock.cond.notify_all();
    }

    /// Releases the lock, runs `f`, and reacquires before returning.
    pub fn reacquire_after<R, F: FnOnce() -> R>(&mut self, f: F) -> R {
        drop(self.guard.take());
        let r = f();
        self.guard = Some(
            self.lock
                .mutex
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        r
    }
}

impl<T> core::ops::Deref for SleepableLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("deref: guard")
    }
}

impl<T> core::ops::DerefMut for SleepableLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("deref_mut: guard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn sleep_wakes_on_wakeup() {
        let lock = Arc::new(SleepableLock::new(false));
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let mut guard = lock.lock();
                while !*guard {
                    guard.sleep();
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        let mut guard = lock.lock();
        *guard = true;
        guard.wakeup();
        drop(guard);
        waiter.join().unwrap();
    }

    #[test]
    fn reacquire_after_releases() {
        let lock = Arc::new(SleepableLock::new(0u32));
        let mut guard = lock.lock();
        let other = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                *lock.lock() += 1;
            })
        };
        guard.reacquire_after(|| {
            // The spawned thread can take the lock while we are out here.
            other.join().unwrap();
        });
        assert_eq!(*guard, 1);
    }
}
