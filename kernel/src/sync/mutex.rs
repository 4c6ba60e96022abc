//! Sleeping mutex: a binary semaphore wrapped around its data.
//!
//! Contended lockers go to sleep on the semaphore's FIFO queue instead
//! of spinning, so this is the primitive to hold across anything that
//! may reschedule. Must not be used from interrupt context.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::semaphore::Semaphore;
use crate::error::Result;

/// A sleeping mutex protecting data of type `T`.
pub struct Mutex<T> {
    sem: Semaphore,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Mutex<T> {}
unsafe impl<T: Send> Send for Mutex<T> {}

/// RAII guard for a held [`Mutex`]. Releases on drop.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    /// Create a new unlocked mutex wrapping the given data.
    pub const fn new(data: T) -> Mutex<T> {
        Mutex { sem: Semaphore::new(1), data: UnsafeCell::new(data) }
    }

    /// Acquire the mutex, sleeping while it is contended.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.sem.wait();
        MutexGuard { mutex: self }
    }

    /// Acquire, but let a signal abort the sleep with `Interrupted`.
    pub fn lock_interruptible(&self) -> Result<MutexGuard<'_, T>> {
        self.sem.wait_interruptible()?;
        Ok(MutexGuard { mutex: self })
    }

    /// Try to acquire without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.sem.try_wait() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// True if some thread is asleep waiting for this mutex.
    pub fn has_waiters(&self) -> bool {
        self.sem.has_waiters()
    }
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.sem.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::scheduler::{join, spawn};

    static COUNTER: Mutex<u64> = Mutex::new(0);

    fn incrementer(_: usize) {
        for _ in 0..10_000 {
            *COUNTER.lock() += 1;
        }
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        const THREADS: usize = 4;
        let tids: alloc::vec::Vec<_> =
            (0..THREADS).map(|i| spawn(incrementer, i, 40, "inc")).collect();
        for tid in tids {
            assert_eq!(join(tid), Some(0));
        }
        assert_eq!(*COUNTER.lock(), (THREADS as u64) * 10_000);
    }

    #[test]
    fn try_lock_respects_holder() {
        static M: Mutex<i32> = Mutex::new(7);
        let guard = M.lock();
        assert!(M.try_lock().is_none());
        drop(guard);
        assert_eq!(*M.try_lock().unwrap(), 7);
    }
}
