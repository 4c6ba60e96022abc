//! IRQ-safe spinlock with automatic interrupt disable/restore.
//!
//! Disables local interrupts before acquiring the lock and restores the
//! previous interrupt state on drop. Safe to share with interrupt context:
//! a handler on the same core can never spin on a lock the interrupted
//! code holds, because the holder had interrupts off.
//!
//! Never sleep while holding one. Critical sections must stay short.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::hal;

/// An IRQ-safe spinlock protecting data of type `T`.
pub struct Spinlock<T> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

/// RAII guard for a held [`Spinlock`].
///
/// Provides `Deref`/`DerefMut` access to the protected data. On drop,
/// releases the lock and restores the interrupt state saved at
/// acquisition time.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    irq_was_enabled: bool,
}

impl<T> Spinlock<T> {
    /// Create a new unlocked spinlock wrapping the given data.
    pub const fn new(data: T) -> Self {
        Spinlock {
            lock: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning until it becomes available.
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        // Save and disable interrupts BEFORE spinning: an IRQ handler on
        // this core taking the same lock must find us not holding it.
        let was_enabled = hal::interrupts_enabled();
        hal::disable_interrupts();

        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Read-only spin between CAS attempts keeps the cache line shared.
            while self.lock.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinlockGuard { lock: self, irq_was_enabled: was_enabled }
    }

    /// Try to acquire the lock without spinning.
    ///
    /// Returns `Some(guard)` on success; restores interrupt state on failure.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        let was_enabled = hal::interrupts_enabled();
        hal::disable_interrupts();

        if self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinlockGuard { lock: self, irq_was_enabled: was_enabled })
        } else {
            if was_enabled {
                hal::enable_interrupts();
            }
            None
        }
    }

    /// Access the data without locking. `&mut self` proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Release a lock whose guard was forgotten.
    ///
    /// Used only by the scheduler's context-switch handoff: the CPU that
    /// switches away keeps the scheduler locked across the switch, and
    /// the thread that gains the CPU releases it here.
    ///
    /// # Safety
    /// The caller must be the logical owner of a held lock with a
    /// forgotten guard; interrupt state is not restored.
    #[cfg(target_os = "none")]
    pub(crate) unsafe fn force_unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

impl<'a, T> Deref for SpinlockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinlockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinlockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.lock.store(false, Ordering::Release);
        // Restore interrupt state AFTER releasing. Nested guards restore
        // outside-in: inner guards saved IF=0 and leave it off.
        if self.irq_was_enabled {
            hal::enable_interrupts();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn exclusive_access() {
        let lock = Arc::new(Spinlock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Spinlock::new(5);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert_eq!(*lock.try_lock().unwrap(), 5);
    }
}
