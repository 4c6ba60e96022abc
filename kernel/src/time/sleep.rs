//! Timed sleeps (the nanosleep primitive).
//!
//! A sleep is a linkless poll wait: nothing to watch, only the timeout
//! side of the descriptor race. This keeps every timed block in the
//! kernel on the same timer + DPC + wake-reason path.

use crate::error::{KernelError, Result};
use crate::poll::{WaitDescriptor, WaitOutcome};

/// Block the calling thread for at least `us` microseconds.
/// Interruptible: a signal aborts with `Interrupted`.
pub fn sleep_us(us: u64) -> Result<()> {
    if us == 0 {
        return Ok(());
    }
    let mut d = WaitDescriptor::new(0)?;
    let outcome = d.wait(us);
    d.leave();
    match outcome {
        WaitOutcome::TimedOut => Ok(()),
        WaitOutcome::Interrupted => Err(KernelError::Interrupted),
        WaitOutcome::Event { .. } => unreachable!("linkless wait delivered an event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::scheduler::{interrupt_thread, join, spawn, thread_exists};
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn sleeps_at_least_the_requested_time() {
        let start = Instant::now();
        assert_eq!(sleep_us(10_000), Ok(()));
        assert!(Instant::now() - start >= Duration::from_millis(9));
    }

    static SLEEP_RESULT: AtomicU32 = AtomicU32::new(0);

    fn long_sleeper(_: usize) {
        match sleep_us(10_000_000) {
            Err(KernelError::Interrupted) => SLEEP_RESULT.store(1, Ordering::SeqCst),
            _ => SLEEP_RESULT.store(2, Ordering::SeqCst),
        }
    }

    #[test]
    fn signal_interrupts_a_sleep() {
        let tid = spawn(long_sleeper, 0, 40, "sleeper");
        let deadline = Instant::now() + Duration::from_secs(5);
        while SLEEP_RESULT.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "sleeper never woke");
            // Keep poking: the sleeper may not have entered the
            // interruptible window yet.
            if thread_exists(tid) {
                interrupt_thread(tid);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        join(tid);
        assert_eq!(SLEEP_RESULT.load(Ordering::SeqCst), 1);
    }
}
