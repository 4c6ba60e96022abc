//! Futex: blocking keyed by the address of a watched word.
//!
//! Wait slots are wait headers created lazily per address and destroyed
//! once their waiter count returns to zero. A wake with no registered
//! waiter is deliberately lost; waiters close that race by re-validating
//! the word after subscribing and before sleeping.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{KernelError, Result};
use crate::poll::{PollEvents, WaitDescriptor, WaitHeader, WaitOutcome};
use crate::sync::spinlock::Spinlock;

struct FutexSlot {
    key: usize,
    waiters: usize,
    /// Boxed so the header keeps its address while the table reshuffles.
    header: Box<WaitHeader>,
}

static FUTEXES: Spinlock<Vec<FutexSlot>> = Spinlock::new(Vec::new());

/// Block until [`wake`] is called on `word`, if `*word == expected`.
///
/// `WouldBlock` if the word already changed (no sleep), `TimedOut` after
/// `timeout_us` microseconds (`0` = forever), `Interrupted` on signal.
/// Spurious wakeups are possible; callers loop.
pub fn wait(word: &AtomicU32, expected: u32, timeout_us: u64) -> Result<()> {
    let key = word as *const AtomicU32 as usize;
    if word.load(Ordering::Acquire) != expected {
        return Err(KernelError::WouldBlock);
    }

    let header: *const WaitHeader = {
        let mut table = FUTEXES.lock();
        let slot = match table.iter_mut().position(|s| s.key == key) {
            Some(pos) => &mut table[pos],
            None => {
                table.push(FutexSlot {
                    key,
                    waiters: 0,
                    header: Box::new(WaitHeader::new()),
                });
                table.last_mut().expect("slot just pushed")
            }
        };
        slot.waiters += 1;
        &*slot.header as *const WaitHeader
    };

    let result = (|| {
        let mut d = WaitDescriptor::new(1)?;
        // SAFETY: the slot (and its boxed header) lives while our
        // registration keeps waiters > 0.
        d.watch(0, unsafe { &*header }, PollEvents::READABLE)?;
        // Re-validate after subscribing: a wake between the first check
        // and the subscription found no subscriber.
        let outcome = if word.load(Ordering::Acquire) != expected {
            None
        } else {
            Some(d.wait(timeout_us))
        };
        d.leave();
        match outcome {
            None | Some(WaitOutcome::Event { .. }) => Ok(()),
            Some(WaitOutcome::TimedOut) => Err(KernelError::TimedOut),
            Some(WaitOutcome::Interrupted) => Err(KernelError::Interrupted),
        }
    })();

    let mut table = FUTEXES.lock();
    if let Some(pos) = table.iter().position(|s| s.key == key) {
        table[pos].waiters -= 1;
        if table[pos].waiters == 0 {
            table.swap_remove(pos);
        }
    }
    result
}

/// Wake the waiters registered on `word`. Returns true if a wait slot
/// existed. Woken threads re-validate the word, so waking all of them
/// is correct (if occasionally generous).
pub fn wake(word: &AtomicU32) -> bool {
    let table = FUTEXES.lock();
    match table.iter().find(|s| s.key == word as *const AtomicU32 as usize) {
        Some(slot) => {
            // Notify under the table lock: the slot may be freed the
            // moment the last waiter deregisters.
            slot.header.notify(PollEvents::READABLE);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::scheduler::{join, spawn};
    use std::time::{Duration, Instant};

    #[test]
    fn changed_word_does_not_sleep() {
        static WORD: AtomicU32 = AtomicU32::new(3);
        assert_eq!(wait(&WORD, 0, 0), Err(KernelError::WouldBlock));
    }

    #[test]
    fn wait_times_out() {
        static WORD: AtomicU32 = AtomicU32::new(0);
        let start = Instant::now();
        assert_eq!(wait(&WORD, 0, 15_000), Err(KernelError::TimedOut));
        assert!(Instant::now() - start >= Duration::from_millis(13));
    }

    static RT_WORD: AtomicU32 = AtomicU32::new(0);
    static RT_DONE: AtomicU32 = AtomicU32::new(0);

    fn rt_waiter(_: usize) {
        // Loop on the word like a userspace mutex would.
        while RT_WORD.load(Ordering::Acquire) == 0 {
            let _ = wait(&RT_WORD, 0, 0);
        }
        RT_DONE.store(1, Ordering::Release);
    }

    #[test]
    fn wake_releases_waiter() {
        let tid = spawn(rt_waiter, 0, 40, "futex-wait");
        std::thread::sleep(Duration::from_millis(5));
        RT_WORD.store(1, Ordering::Release);
        let deadline = Instant::now() + Duration::from_secs(5);
        while RT_DONE.load(Ordering::Acquire) == 0 {
            assert!(Instant::now() < deadline, "futex waiter never woke");
            wake(&RT_WORD);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(join(tid), Some(0));
    }

    #[test]
    fn slot_is_destroyed_at_zero_waiters() {
        static WORD: AtomicU32 = AtomicU32::new(0);
        assert_eq!(wait(&WORD, 0, 5_000), Err(KernelError::TimedOut));
        // The waiter deregistered on the way out; no slot remains.
        assert!(!wake(&WORD));
    }
}
