//! Mutexes with a debug-only lock-order tracker.
//!
//! Scheduler locks declare an optional predecessor. In debug builds a
//! per-thread stack of held locks is maintained; acquiring a checked lock is
//! legal only when no checked lock is held, or when the most recently
//! acquired one is the declared predecessor. Violations of the declared
//! graph panic immediately instead of deadlocking later.

#[cfg(debug_assertions)]
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Identity of a [`CheckedLock`], used to declare predecessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockId(u64);

fn next_lock_id() -> LockId {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    LockId(COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD_LOCKS: RefCell<Vec<LockId>> = const { RefCell::new(Vec::new()) };
}

#[cfg(debug_assertions)]
fn assert_acquisition_allowed(id: LockId, predecessor: Option<LockId>) {
    HELD_LOCKS.with(|held| {
        let held = held.borrow();
        if let Some(&last) = held.last() {
            assert_ne!(last, id, "recursive acquisition of scheduler lock");
            assert_eq!(
                Some(last),
                predecessor,
                "scheduler lock acquired out of declared order"
            );
        }
    });
}

#[cfg(debug_assertions)]
fn register_held(id: LockId) {
    HELD_LOCKS.with(|held| held.borrow_mut().push(id));
}

#[cfg(debug_assertions)]
fn unregister_held(id: LockId) {
    HELD_LOCKS.with(|held| {
        let mut held = held.borrow_mut();
        let pos = held
            .iter()
            .rposition(|&h| h == id)
            .expect("released a scheduler lock that was not held");
        held.remove(pos);
    });
}

/// A mutex participating in the declared lock-order graph.
pub struct CheckedLock<T> {
    id: LockId,
    predecessor: Option<LockId>,
    mutex: Mutex<T>,
}

impl<T> CheckedLock<T> {
    /// Creates a lock that may only be acquired while no checked lock is
    /// held.
    pub fn new(value: T) -> Self {
        Self {
            id: next_lock_id(),
            predecessor: None,
            mutex: Mutex::new(value),
        }
    }

    /// Creates a lock that may additionally be acquired while `predecessor`
    /// is the most recently acquired checked lock.
    pub fn with_predecessor(value: T, predecessor: LockId) -> Self {
        Self {
            id: next_lock_id(),
            predecessor: Some(predecessor),
            mutex: Mutex::new(value),
        }
    }

    /// This lock's identity, for declaring successors.
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Acquires the lock, verifying the declared order in debug builds.
    pub fn lock(&self) -> CheckedLockGuard<'_, T> {
        #[cfg(debug_assertions)]
        assert_acquisition_allowed(self.id, self.predecessor);
        let guard = self.mutex.lock().unwrap();
        #[cfg(debug_assertions)]
        register_held(self.id);
        CheckedLockGuard {
            id: self.id,
            guard: Some(guard),
        }
    }

    fn relock<'a>(&self, guard: MutexGuard<'a, T>) -> CheckedLockGuard<'a, T> {
        #[cfg(debug_assertions)]
        register_held(self.id);
        CheckedLockGuard {
            id: self.id,
            guard: Some(guard),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CheckedLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckedLock").field("id", &self.id).finish()
    }
}

/// Guard over a [`CheckedLock`].
pub struct CheckedLockGuard<'a, T> {
    id: LockId,
    guard: Option<MutexGuard<'a, T>>,
}

impl<T> Deref for CheckedLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for CheckedLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for CheckedLockGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        if self.guard.is_some() {
            unregister_held(self.id);
        }
    }
}

/// Condition variable usable with [`CheckedLock`] guards.
#[derive(Debug, Default)]
pub struct CheckedCondvar {
    condvar: Condvar,
}

impl CheckedCondvar {
    /// Creates a condition variable.
    pub fn new() -> Self {
        Self {
            condvar: Condvar::new(),
        }
    }

    /// Releases the guard, waits for a notification, and re-acquires.
    pub fn wait<'a, T>(
        &self,
        lock: &'a CheckedLock<T>,
        mut guard: CheckedLockGuard<'a, T>,
    ) -> CheckedLockGuard<'a, T> {
        let inner = guard.guard.take().unwrap();
        #[cfg(debug_assertions)]
        unregister_held(guard.id);
        let inner = self.condvar.wait(inner).unwrap();
        lock.relock(inner)
    }

    /// As [`CheckedCondvar::wait`], with a timeout. The bool reports whether
    /// the wait timed out.
    pub fn wait_timeout<'a, T>(
        &self,
        lock: &'a CheckedLock<T>,
        mut guard: CheckedLockGuard<'a, T>,
        timeout: Duration,
    ) -> (CheckedLockGuard<'a, T>, bool) {
        let inner = guard.guard.take().unwrap();
        #[cfg(debug_assertions)]
        unregister_held(guard.id);
        let (inner, result) = self.condvar.wait_timeout(inner, timeout).unwrap();
        (lock.relock(inner), result.timed_out())
    }

    /// Wakes one waiter.
    pub fn notify_one(&self) {
        self.condvar.notify_one();
    }

    /// Wakes all waiters.
    pub fn notify_all(&self) {
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_lock() {
        let lock = CheckedLock::new(5);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_predecessor_chain_allowed() {
        let first = CheckedLock::new(());
        let second = CheckedLock::with_predecessor((), first.id());

        let _only_second = second.lock();
        drop(_only_second);

        let _a = first.lock();
        let _b = second.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "out of declared order")]
    fn test_out_of_order_acquisition_panics() {
        let first = CheckedLock::new(());
        let second = CheckedLock::with_predecessor((), first.id());

        let _b = second.lock();
        let _a = first.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "recursive acquisition")]
    fn test_recursive_acquisition_panics() {
        let lock = CheckedLock::new(());
        let _a = lock.lock();
        let _b = lock.lock();
    }

    #[test]
    fn test_condvar_wait_timeout() {
        let lock = CheckedLock::new(());
        let cv = CheckedCondvar::new();
        let guard = lock.lock();
        let (_guard, timed_out) = cv.wait_timeout(&lock, guard, Duration::from_millis(10));
        assert!(timed_out);
    }

    #[test]
    fn test_condvar_notify() {
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(CheckedLock::new(false));
        let cv = Arc::new(CheckedCondvar::new());

        let lock2 = Arc::clone(&lock);
        let cv2 = Arc::clone(&cv);
        let waiter = thread::spawn(move || {
            let mut guard = lock2.lock();
            while !*guard {
                guard = cv2.wait(&lock2, guard);
            }
        });

        {
            let mut guard = lock.lock();
            *guard = true;
        }
        cv.notify_one();
        waiter.join().unwrap();
    }
}
