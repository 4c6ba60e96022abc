//! Counting semaphore with a FIFO sleep queue.
//!
//! The count goes negative to mirror the number of queued waiters.
//! Waiters are inserted at the head of the queue and woken from the
//! tail, so the longest-waiting thread is served first. An aborted wait
//! (signal interruption or timeout) gives its count back, and if a
//! racing `signal` already granted it the token, forwards that token to
//! the next waiter so no wakeup is ever lost.
//!
//! Before the scheduler comes online, `wait` degrades to a `try_wait`
//! spin loop so early boot code can use the same objects.

use alloc::collections::VecDeque;

use crate::error::{KernelError, Result};
use crate::sync::spinlock::Spinlock;
use crate::task::scheduler::{self, WakeReason};
use crate::task::thread::Tid;

/// Counting semaphore. A mutex is one of these with initial count 1.
pub struct Semaphore {
    inner: Spinlock<SemInner>,
}

struct SemInner {
    count: i32,
    /// Head = newest waiter, tail = oldest.
    queue: VecDeque<Tid>,
}

impl Semaphore {
    /// Create a semaphore with the given initial count.
    pub const fn new(initial: i32) -> Semaphore {
        Semaphore {
            inner: Spinlock::new(SemInner { count: initial, queue: VecDeque::new() }),
        }
    }

    /// Decrement (P operation), sleeping uninterruptibly if the count is
    /// exhausted.
    pub fn wait(&self) {
        match self.wait_inner(false, 0) {
            Ok(()) => {}
            Err(e) => panic!("uninterruptible semaphore wait failed: {}", e),
        }
    }

    /// Like [`Semaphore::wait`], but a signal aborts the wait with
    /// `Interrupted`.
    pub fn wait_interruptible(&self) -> Result<()> {
        self.wait_inner(true, 0)
    }

    /// Interruptible wait bounded by `us` microseconds; `TimedOut` if the
    /// deadline fires first. The timeout rides the timer queue and a DPC
    /// racing the signal on the thread's wake-reason cell.
    pub fn wait_timeout(&self, us: u64) -> Result<()> {
        self.wait_inner(true, us)
    }

    fn wait_inner(&self, interruptible: bool, timeout_us: u64) -> Result<()> {
        if !scheduler::is_online() {
            // Bootstrap: no scheduling context to block on yet.
            loop {
                if self.try_wait() {
                    return Ok(());
                }
                core::hint::spin_loop();
            }
        }

        let tid = scheduler::current_tid();
        {
            let mut s = self.inner.lock();
            s.count -= 1;
            if s.count >= 0 {
                return Ok(());
            }
            s.queue.push_front(tid);
            // Prepared before the lock drops: a signal landing from here
            // on deposits its wake reason instead of getting lost.
            scheduler::prepare_sleep(interruptible);
        }

        let timer = if timeout_us != 0 {
            match scheduler::WakeTimer::arm(tid, timeout_us) {
                Ok(t) => Some(t),
                Err(e) => {
                    scheduler::abort_sleep();
                    self.give_back(tid);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let reason = scheduler::yield_now();
        if let Some(t) = timer {
            t.cancel();
        }

        match reason {
            WakeReason::Normal => Ok(()),
            reason => {
                self.give_back(tid);
                Err(match reason {
                    WakeReason::Interrupted => KernelError::Interrupted,
                    _ => KernelError::TimedOut,
                })
            }
        }
    }

    /// Abort path: withdraw from the queue and restore the count, or, if
    /// a racing `signal` already granted us the token, pass it on.
    fn give_back(&self, tid: Tid) {
        let granted = {
            let mut s = self.inner.lock();
            match s.queue.iter().position(|&t| t == tid) {
                Some(pos) => {
                    s.queue.remove(pos);
                    s.count += 1;
                    false
                }
                None => true,
            }
        };
        if granted {
            self.signal();
        }
    }

    /// Increment (V operation); wakes the oldest waiter if any.
    pub fn signal(&self) {
        let wake = {
            let mut s = self.inner.lock();
            s.count += 1;
            if s.count <= 0 {
                s.queue.pop_back()
            } else {
                None
            }
        };
        // Wake outside the semaphore lock.
        if let Some(tid) = wake {
            scheduler::wake_thread(tid, WakeReason::Normal);
        }
    }

    /// Non-blocking decrement; true only if the count was positive.
    pub fn try_wait(&self) -> bool {
        let mut s = self.inner.lock();
        if s.count > 0 {
            s.count -= 1;
            true
        } else {
            false
        }
    }

    /// True if any thread is queued on this semaphore.
    pub fn has_waiters(&self) -> bool {
        !self.inner.lock().queue.is_empty()
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::scheduler::{interrupt_thread, join, spawn};
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    static FIFO_SEM: Semaphore = Semaphore::new(0);
    static FIFO_ORDER: Spinlock<alloc::vec::Vec<u32>> = Spinlock::new(alloc::vec::Vec::new());

    fn fifo_waiter(arg: usize) {
        FIFO_SEM.wait();
        FIFO_ORDER.lock().push(arg as u32);
    }

    #[test]
    fn wakes_waiters_fifo() {
        for i in 1..=3 {
            spawn(fifo_waiter, i, 40, "fifo");
            wait_until(|| FIFO_SEM.waiter_count() == i);
        }
        for served in 1..=3 {
            FIFO_SEM.signal();
            wait_until(|| FIFO_ORDER.lock().len() == served);
        }
        assert_eq!(FIFO_ORDER.lock().clone(), alloc::vec![1, 2, 3]);
        assert!(!FIFO_SEM.has_waiters());
    }

    static INT_SEM: Semaphore = Semaphore::new(0);
    static INT_RESULT: AtomicU32 = AtomicU32::new(0);

    fn interruptible_waiter(_: usize) {
        match INT_SEM.wait_interruptible() {
            Err(KernelError::Interrupted) => INT_RESULT.store(1, Ordering::SeqCst),
            _ => INT_RESULT.store(2, Ordering::SeqCst),
        }
    }

    #[test]
    fn interruption_restores_count_and_queue() {
        let tid = spawn(interruptible_waiter, 0, 40, "int");
        wait_until(|| INT_SEM.has_waiters());
        interrupt_thread(tid);
        assert_eq!(join(tid), Some(0));
        assert_eq!(INT_RESULT.load(Ordering::SeqCst), 1);
        assert!(!INT_SEM.has_waiters());
        // The aborted wait gave its count back: one signal, one token.
        INT_SEM.signal();
        assert!(INT_SEM.try_wait());
        assert!(!INT_SEM.try_wait());
    }

    #[test]
    fn timed_wait_expires_without_signal() {
        static SEM: Semaphore = Semaphore::new(0);
        let start = Instant::now();
        let result = SEM.wait_timeout(20_000);
        assert_eq!(result, Err(KernelError::TimedOut));
        assert!(Instant::now() - start >= Duration::from_millis(18));
        assert!(!SEM.has_waiters());
        SEM.signal();
        assert!(SEM.try_wait());
    }

    #[test]
    fn timed_wait_succeeds_on_signal() {
        static SEM: Semaphore = Semaphore::new(0);

        fn signaller(_: usize) {
            std::thread::sleep(Duration::from_millis(5));
            SEM.signal();
        }

        spawn(signaller, 0, 40, "sig");
        assert_eq!(SEM.wait_timeout(5_000_000), Ok(()));
    }

    #[test]
    fn try_wait_only_on_positive_count() {
        static SEM: Semaphore = Semaphore::new(2);
        assert!(SEM.try_wait());
        assert!(SEM.try_wait());
        assert!(!SEM.try_wait());
        SEM.signal();
        assert!(SEM.try_wait());
    }
}
