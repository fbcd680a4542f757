//! Lock primitives with blocking-context tracking.
//!
//! The manager has two kinds of critical sections. Raw spinlocks guard short,
//! non-suspending sections (the frame table, the TLB slots) and may be taken
//! from contexts that must not block, such as interrupt handlers. Sleep locks
//! guard sections that may suspend (page-table mutation, swap I/O) and must
//! never be acquired while a raw spinlock is held.
//!
//! Holding a raw spinlock marks the current context no-sleep; code that can be
//! reached from both locked and unlocked contexts consults
//! [`blocking_forbidden`] to decide whether it may take a sleep lock itself.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Count of raw spinlocks currently held.
///
/// In a kernel build this is a single processor-wide counter; the design
/// targets correctness for interleaved fault handling, not multi-core
/// scalability, so one conservative counter is acceptable. In emulation it is
/// thread-local so concurrent tests do not observe each other's locks.
#[cfg(not(any(test, feature = "software-emulation")))]
static SPINLOCKS_HELD: AtomicUsize = AtomicUsize::new(0);

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static SPINLOCKS_HELD: AtomicUsize = const { AtomicUsize::new(0) };
}

fn spinlock_depth_add(delta: isize) {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        if delta >= 0 {
            SPINLOCKS_HELD.fetch_add(delta as usize, Ordering::Relaxed);
        } else {
            SPINLOCKS_HELD.fetch_sub((-delta) as usize, Ordering::Relaxed);
        }
    }

    #[cfg(any(test, feature = "software-emulation"))]
    SPINLOCKS_HELD.with(|d| {
        if delta >= 0 {
            d.fetch_add(delta as usize, Ordering::Relaxed);
        } else {
            d.fetch_sub((-delta) as usize, Ordering::Relaxed);
        }
    });
}

fn spinlock_depth() -> usize {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        SPINLOCKS_HELD.load(Ordering::Relaxed)
    }

    #[cfg(any(test, feature = "software-emulation"))]
    SPINLOCKS_HELD.with(|d| d.load(Ordering::Relaxed))
}

/// Returns true if the current context must not block.
///
/// True while any raw spinlock is held. Sleep-lock acquisition from such a
/// context is a bug; lookup helpers reachable from both contexts use this to
/// fall back to non-blocking acquisition.
pub fn blocking_forbidden() -> bool {
    spinlock_depth() > 0
}

/// A busy-wait mutual-exclusion lock for short, non-suspending sections.
///
/// Safe to take from no-sleep contexts. While the guard lives, the current
/// context is marked no-sleep.
pub struct RawSpinLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> RawSpinLock<T> {
    /// Creates a new raw spinlock.
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquires the lock, spinning until it is available.
    pub fn lock(&self) -> RawSpinGuard<'_, T> {
        let guard = self.inner.lock();
        spinlock_depth_add(1);
        RawSpinGuard { guard }
    }
}

/// RAII guard for a [`RawSpinLock`]; releases the lock and the no-sleep mark
/// on drop.
pub struct RawSpinGuard<'a, T> {
    guard: spin::MutexGuard<'a, T>,
}

impl<T> core::ops::Deref for RawSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> core::ops::DerefMut for RawSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RawSpinGuard<'_, T> {
    fn drop(&mut self) {
        spinlock_depth_add(-1);
    }
}

/// A lock for sections that may suspend (swap I/O, page-table mutation).
///
/// Acquisition debug-asserts that blocking is currently allowed. Callers must
/// release it before any operation that depends on a raw spinlock holder
/// making progress.
pub struct SleepLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> SleepLock<T> {
    /// Creates a new sleep lock.
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquires the lock, waiting until it is available.
    ///
    /// # Panics
    ///
    /// Debug builds panic if called from a no-sleep context.
    pub fn lock(&self) -> spin::MutexGuard<'_, T> {
        debug_assert!(
            !blocking_forbidden(),
            "sleep lock acquired from a no-sleep context"
        );
        self.inner.lock()
    }

    /// Attempts to acquire the lock without waiting.
    pub fn try_lock(&self) -> Option<spin::MutexGuard<'_, T>> {
        self.inner.try_lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_allowed_by_default() {
        assert!(!blocking_forbidden());
    }

    #[test]
    fn raw_spinlock_marks_context() {
        let lock = RawSpinLock::new(5);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 5);
            assert!(blocking_forbidden());
        }
        assert!(!blocking_forbidden());
    }

    #[test]
    fn nested_raw_spinlocks_count() {
        let a = RawSpinLock::new(());
        let b = RawSpinLock::new(());
        let ga = a.lock();
        {
            let _gb = b.lock();
            assert!(blocking_forbidden());
        }
        assert!(blocking_forbidden());
        drop(ga);
        assert!(!blocking_forbidden());
    }

    #[test]
    fn sleep_lock_mutation() {
        let lock = SleepLock::new(0usize);
        *lock.lock() += 3;
        assert_eq!(*lock.lock(), 3);
    }

    #[test]
    fn sleep_lock_try_lock_when_held() {
        let lock = SleepLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    #[should_panic(expected = "sleep lock acquired from a no-sleep context")]
    fn sleep_lock_panics_under_spinlock() {
        let spin = RawSpinLock::new(());
        let sleep = SleepLock::new(());
        let _guard = spin.lock();
        let _bad = sleep.lock();
    }
}
