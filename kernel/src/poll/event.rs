//! Single-object wait/signal: the bounded specialization of the poll
//! protocol used wherever one producer wakes waiters of one condition.
//!
//! Auto-reset semantics: `signal` latches a flag and notifies; exactly
//! one waiter consumes the flag per signal, and a signal with no waiter
//! is kept for the next one.

use core::sync::atomic::{AtomicBool, Ordering};

use super::{PollEvents, WaitDescriptor, WaitHeader, WaitOutcome};
use crate::error::{KernelError, Result};

/// An auto-reset event.
pub struct Event {
    header: WaitHeader,
    signaled: AtomicBool,
}

impl Event {
    pub const fn new() -> Event {
        Event { header: WaitHeader::new(), signaled: AtomicBool::new(false) }
    }

    /// Latch the event and wake a waiter if one is subscribed.
    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
        self.header.notify(PollEvents::READABLE);
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Wait until signaled, consuming the signal. `timeout_us == 0`
    /// waits forever.
    pub fn wait(&self, timeout_us: u64) -> Result<()> {
        loop {
            if self.signaled.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            let mut d = WaitDescriptor::new(1)?;
            d.watch(0, &self.header, PollEvents::READABLE)?;
            // Re-check after subscribing: a signal that ran in between
            // found no subscriber and only set the flag.
            if self.signaled.swap(false, Ordering::AcqRel) {
                d.leave();
                return Ok(());
            }
            let outcome = d.wait(timeout_us);
            d.leave();
            match outcome {
                // Woken; loop to contend for the flag (another waiter
                // may have consumed this signal first).
                WaitOutcome::Event { .. } => continue,
                WaitOutcome::TimedOut => return Err(KernelError::TimedOut),
                WaitOutcome::Interrupted => return Err(KernelError::Interrupted),
            }
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::scheduler::{join, spawn};
    use std::time::{Duration, Instant};

    #[test]
    fn signal_before_wait_is_kept() {
        static EV: Event = Event::new();
        EV.signal();
        assert!(EV.is_signaled());
        assert_eq!(EV.wait(0), Ok(()));
        assert!(!EV.is_signaled());
    }

    #[test]
    fn wait_times_out_without_signal() {
        static EV: Event = Event::new();
        let start = Instant::now();
        assert_eq!(EV.wait(15_000), Err(KernelError::TimedOut));
        assert!(Instant::now() - start >= Duration::from_millis(13));
    }

    static CROSS: Event = Event::new();

    fn signaller(_: usize) {
        std::thread::sleep(Duration::from_millis(5));
        CROSS.signal();
    }

    #[test]
    fn cross_thread_signal_wakes_waiter() {
        let tid = spawn(signaller, 0, 40, "ev-sig");
        assert_eq!(CROSS.wait(5_000_000), Ok(()));
        join(tid);
    }
}
