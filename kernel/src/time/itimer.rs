//! Interval timers: pausable, repeatable software timers built from one
//! timer entry plus one DPC.
//!
//! An interval timer is owned by the CPU it was resumed on; pausing from
//! another CPU migrates execution to the owner first (cooperative
//! hand-off, never a remote lock on the owner's timer queue). These back
//! the POSIX real/virtual/profiling per-process timers in the syscall
//! layer.

use crate::arch::hal;
use crate::config::MAX_ITIMERS;
use crate::error::{KernelError, Result};
use crate::irq::dpc::{self, DeferredCall, DpcToken};
use crate::sync::spinlock::Spinlock;
use crate::task::scheduler;
use crate::time::timer::{self, TimerId};

/// User callback, invoked from DPC level on the owning CPU.
pub type ItimerFn = fn(usize);

struct ItimerCore {
    /// Time to the next fire when paused; live remaining time is in the
    /// owner CPU's timer queue while armed.
    remaining_us: u64,
    /// Repeat interval; 0 for one-shot.
    period_us: u64,
    /// CPU whose timer queue holds the entry while armed.
    owner_cpu: Option<usize>,
    paused: bool,
    entry: Option<TimerId>,
    dpc: DeferredCall,
    callback: ItimerFn,
    arg: usize,
}

struct ItimerSlot {
    generation: u32,
    core: Option<ItimerCore>,
}

static ITIMERS: [Spinlock<ItimerSlot>; MAX_ITIMERS] =
    [const { Spinlock::new(ItimerSlot { generation: 0, core: None }) }; MAX_ITIMERS];

fn pack_ref(slot: u32, generation: u32) -> u32 {
    (slot << 24) | (generation & 0x00FF_FFFF)
}

fn unpack_ref(raw: u32) -> (usize, u32) {
    ((raw >> 24) as usize, raw & 0x00FF_FFFF)
}

/// Owning handle to one interval timer.
pub struct IntervalTimer {
    slot: u32,
    generation: u32,
}

impl IntervalTimer {
    /// Allocate an interval timer (paused, nothing recorded).
    pub fn new(callback: ItimerFn, arg: usize) -> Result<IntervalTimer> {
        for (i, slot) in ITIMERS.iter().enumerate() {
            let mut g = slot.lock();
            if g.core.is_some() {
                continue;
            }
            let dpc = DeferredCall::new()?;
            g.generation = g.generation.wrapping_add(1);
            g.core = Some(ItimerCore {
                remaining_us: 0,
                period_us: 0,
                owner_cpu: None,
                paused: true,
                entry: None,
                dpc,
                callback,
                arg,
            });
            return Ok(IntervalTimer { slot: i as u32, generation: g.generation });
        }
        Err(KernelError::Exhausted)
    }

    fn lock_slot(&self) -> crate::sync::spinlock::SpinlockGuard<'static, ItimerSlot> {
        let g = ITIMERS[self.slot as usize].lock();
        assert_eq!(g.generation, self.generation, "stale interval timer handle");
        g
    }

    /// Record duration and repeat interval without arming.
    pub fn set(&self, us: u64, period_us: u64) {
        let mut g = self.lock_slot();
        let core = g.core.as_mut().expect("interval timer freed under a live handle");
        assert!(core.paused, "set() on an armed interval timer");
        core.remaining_us = us;
        core.period_us = period_us;
    }

    /// Arm on the calling CPU. Requires a paused timer with nonzero
    /// remaining time.
    pub fn resume(&self) -> Result<()> {
        let mut g = self.lock_slot();
        let core = g.core.as_mut().expect("interval timer freed under a live handle");
        if !core.paused || core.remaining_us == 0 {
            return Err(KernelError::InvalidArgument);
        }
        core.paused = false;
        core.owner_cpu = Some(hal::cpu_id());
        let arg = core.dpc.token().pack(pack_ref(self.slot, self.generation));
        core.entry = Some(timer::insert(core.remaining_us, 0, itimer_fire, arg));
        Ok(())
    }

    /// Stop the timer, capturing the remaining time for a later
    /// [`IntervalTimer::resume`]; returns it in microseconds.
    ///
    /// If the entry is owned by another CPU, execution migrates there
    /// first. If the entry already fired (consumed, DPC in flight) the
    /// remaining time reads as one tick, distinguishing "about to fire"
    /// from "inactive".
    pub fn pause(&self) -> u64 {
        loop {
            let owner = {
                let mut g = self.lock_slot();
                let core = g.core.as_mut().expect("interval timer freed under a live handle");
                match core.owner_cpu {
                    None => {
                        core.paused = true;
                        return core.remaining_us;
                    }
                    Some(cpu) => cpu,
                }
            };
            if owner == hal::cpu_id() {
                break;
            }
            scheduler::migrate_to(owner);
            // Re-check: the timer may have fired or been re-armed while
            // we were in flight.
        }

        let mut g = self.lock_slot();
        let core = g.core.as_mut().expect("interval timer freed under a live handle");
        if let Some(id) = core.entry.take() {
            core.remaining_us = match timer::cancel(id) {
                Some(remaining_ticks) => (remaining_ticks / hal::ticks_per_us()).max(1),
                None => 1,
            };
            // Retire rather than dequeue: a fire caught between the
            // comparator and the DPC queue holds a now-stale token.
            dpc::retire(&mut core.dpc);
        }
        core.paused = true;
        core.owner_cpu = None;
        core.remaining_us
    }

    /// True while not armed.
    pub fn is_paused(&self) -> bool {
        let g = self.lock_slot();
        g.core.as_ref().map_or(true, |c| c.paused)
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        self.pause();
        let mut g = ITIMERS[self.slot as usize].lock();
        g.generation = g.generation.wrapping_add(1);
        g.core = None;
    }
}

/// Timer-queue callback: hand off to DPC level.
fn itimer_fire(arg: usize) {
    let (token, _) = DpcToken::unpack(arg);
    dpc::enqueue_token(token, itimer_dpc_body, arg);
}

/// Fire DPC: reload the remaining time, run the user callback, and
/// re-insert when periodic. One-shot timers park themselves paused.
fn itimer_dpc_body(arg: usize) {
    let (_, payload) = DpcToken::unpack(arg);
    let (slot, generation) = unpack_ref(payload);

    let callback = {
        let mut g = ITIMERS[slot].lock();
        if g.generation & 0x00FF_FFFF != generation {
            return;
        }
        let core = match g.core.as_mut() {
            Some(c) => c,
            None => return,
        };
        if core.paused {
            // Paused between fire and dispatch; the pause consumed us.
            return;
        }
        core.entry = None;
        if core.period_us != 0 {
            core.remaining_us = core.period_us;
        } else {
            core.paused = true;
            core.owner_cpu = None;
            core.remaining_us = 0;
        }
        (core.callback, core.arg)
    };

    (callback.0)(callback.1);

    // Re-arm after the callback so a callback that pauses its own timer
    // wins.
    let mut g = ITIMERS[slot].lock();
    if g.generation & 0x00FF_FFFF != generation {
        return;
    }
    let core = match g.core.as_mut() {
        Some(c) => c,
        None => return,
    };
    if !core.paused && core.period_us != 0 && core.entry.is_none() {
        let arg = core.dpc.token().pack(pack_ref(slot as u32, generation));
        core.entry = Some(timer::insert(core.period_us, 0, itimer_fire, arg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn one_shot_fires_once_then_parks() {
        static FIRES: AtomicUsize = AtomicUsize::new(0);
        fn cb(n: usize) {
            FIRES.fetch_add(n, Ordering::SeqCst);
        }

        let it = IntervalTimer::new(cb, 1).unwrap();
        it.set(3_000, 0);
        it.resume().unwrap();
        sleep(Duration::from_millis(40));
        assert_eq!(FIRES.load(Ordering::SeqCst), 1);
        assert!(it.is_paused());
        // Nothing left to resume.
        assert_eq!(it.resume(), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn periodic_fires_repeatedly_until_paused() {
        static FIRES: AtomicUsize = AtomicUsize::new(0);
        fn cb(_: usize) {
            FIRES.fetch_add(1, Ordering::SeqCst);
        }

        let it = IntervalTimer::new(cb, 0).unwrap();
        it.set(2_000, 2_000);
        it.resume().unwrap();
        sleep(Duration::from_millis(60));
        let remaining = it.pause();
        let seen = FIRES.load(Ordering::SeqCst);
        assert!(seen >= 2, "periodic itimer fired only {} times", seen);
        assert!(remaining >= 1);
        sleep(Duration::from_millis(20));
        assert_eq!(FIRES.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn pause_resume_preserves_remaining_time() {
        static FIRES: AtomicUsize = AtomicUsize::new(0);
        fn cb(_: usize) {
            FIRES.fetch_add(1, Ordering::SeqCst);
        }

        let it = IntervalTimer::new(cb, 0).unwrap();
        it.set(100_000, 0);
        it.resume().unwrap();
        let remaining = it.pause();
        assert!(remaining >= 1 && remaining <= 100_000);
        assert_eq!(FIRES.load(Ordering::SeqCst), 0);
        it.resume().unwrap();
        sleep(Duration::from_millis(150));
        assert_eq!(FIRES.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pause_before_any_resume_reports_the_set_time() {
        fn cb(_: usize) {}
        let it = IntervalTimer::new(cb, 0).unwrap();
        it.set(7_000, 0);
        assert_eq!(it.pause(), 7_000);
        assert!(it.is_paused());
    }
}
