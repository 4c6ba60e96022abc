//! Per-CPU timer queue.
//!
//! Each CPU keeps one sorted list of absolute-deadline entries behind one
//! hardware comparator. The queue is mutated only from its owning CPU;
//! the public functions here operate on the calling CPU's queue, and ids
//! carry the owning CPU so a cross-CPU `cancel` is caught and panics.
//! Cross-CPU control is done by migrating execution to the owner first
//! (see `scheduler::migrate_to`), never by remote locking.
//!
//! Tick accounting: every time the queue is touched the comparator is
//! stopped and the elapsed part of the armed interval is folded into the
//! CPU's running tick counter, so deadlines stay absolute across re-arms.

use alloc::vec::Vec;

use crate::arch::hal;
use crate::cpu::Cpu;

/// A timer callback. Runs at clock priority on the owning CPU; expected
/// to do no more than enqueue a DPC.
pub type TimerFn = fn(usize);

/// Identifies one queued entry; encodes the owning CPU in the top bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

impl TimerId {
    fn new(cpu: usize, seq: u64) -> TimerId {
        TimerId(((cpu as u64) << 48) | (seq & 0x0000_FFFF_FFFF_FFFF))
    }

    /// CPU whose queue holds (held) this entry.
    pub fn cpu(self) -> usize {
        (self.0 >> 48) as usize
    }
}

struct TimerEntry {
    id: TimerId,
    /// Absolute deadline in the owning CPU's ticks.
    deadline: u64,
    /// Repeat interval in microseconds; 0 for one-shot.
    period_us: u64,
    func: TimerFn,
    arg: usize,
}

/// One CPU's timer queue. Lives inside the `Cpu` record.
pub(crate) struct TimerQueue {
    /// Sorted ascending by deadline; ties keep insertion order.
    entries: Vec<TimerEntry>,
    /// Monotonic tick counter, advanced whenever the comparator is read.
    ticks: u64,
    /// Ticks programmed into the comparator at the last arm; 0 = unarmed.
    armed: u64,
    next_seq: u64,
    /// Set by `stop()` to keep the comparator quiet across migration.
    frozen: bool,
}

impl TimerQueue {
    pub(crate) const fn new() -> TimerQueue {
        TimerQueue { entries: Vec::new(), ticks: 0, armed: 0, next_seq: 1, frozen: false }
    }

    /// Stop the comparator and fold the elapsed ticks into `self.ticks`.
    fn sync_now(&mut self) {
        if self.armed != 0 {
            let remaining = hal::timer_stop();
            self.ticks += self.armed - remaining.min(self.armed);
            self.armed = 0;
        }
    }

    /// Re-arm the comparator for the earliest deadline, if any.
    fn rearm(&mut self) {
        if self.frozen {
            return;
        }
        if let Some(head) = self.entries.first() {
            let delta = head.deadline.saturating_sub(self.ticks).max(1);
            self.armed = delta;
            hal::timer_arm(delta);
        }
    }

    fn sorted_insert(&mut self, entry: TimerEntry) {
        let pos = self
            .entries
            .iter()
            .position(|e| e.deadline > entry.deadline)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }
}

/// Queue a callback `us` microseconds from now on the calling CPU.
/// `period_us != 0` makes the entry re-insert itself on every fire.
pub fn insert(us: u64, period_us: u64, func: TimerFn, arg: usize) -> TimerId {
    let cpu = Cpu::current();
    let mut q = cpu.timers.lock();
    q.sync_now();
    let seq = q.next_seq;
    q.next_seq += 1;
    let id = TimerId::new(cpu.index(), seq);
    let deadline = q.ticks + us.saturating_mul(hal::ticks_per_us());
    q.sorted_insert(TimerEntry { id, deadline, period_us, func, arg });
    q.rearm();
    id
}

/// Remove a queued entry. Returns the unexpired ticks, or `None` if the
/// entry already fired (or never existed).
///
/// Panics when called from a CPU that does not own the entry; the caller
/// must migrate there first.
pub fn cancel(id: TimerId) -> Option<u64> {
    assert_eq!(
        id.cpu(),
        hal::cpu_id(),
        "timer entry cancelled from a CPU that does not own it"
    );
    let cpu = Cpu::current();
    let mut q = cpu.timers.lock();
    q.sync_now();
    let pos = q.entries.iter().position(|e| e.id == id);
    let removed = pos.map(|pos| q.entries.remove(pos));
    let remaining = removed.map(|e| e.deadline.saturating_sub(q.ticks));
    // Re-arm whether or not the entry was found; sync_now stopped the
    // comparator and the rest of the queue still needs it.
    q.rearm();
    remaining
}

/// Comparator interrupt: pop the due head, re-arm for the next one, then
/// run the fired entry's callback (with the queue unlocked).
pub fn isr() {
    let cpu = Cpu::current();
    let fired = {
        let mut q = cpu.timers.lock();
        // Fold the elapsed ticks through sync_now rather than assuming
        // the whole armed interval passed: an insert may have re-armed
        // the comparator between the hardware fire and this ISR, in
        // which case the interrupt is (partly) stale.
        q.sync_now();
        let due = q.entries.first().map_or(false, |e| e.deadline <= q.ticks);
        let fired = if due { Some(q.entries.remove(0)) } else { None };
        if let Some(e) = &fired {
            if e.period_us != 0 {
                let deadline = q.ticks + e.period_us.saturating_mul(hal::ticks_per_us());
                q.sorted_insert(TimerEntry {
                    id: e.id,
                    deadline,
                    period_us: e.period_us,
                    func: e.func,
                    arg: e.arg,
                });
            }
        }
        q.rearm();
        fired
    };
    if let Some(e) = fired {
        (e.func)(e.arg);
    }
}

/// Freeze the calling CPU's comparator without losing remaining-time
/// accounting. Entries stay queued; nothing fires until [`resume`].
pub fn stop() {
    let cpu = Cpu::current();
    let mut q = cpu.timers.lock();
    q.sync_now();
    q.frozen = true;
}

/// Undo [`stop`] and re-arm for the earliest deadline.
pub fn resume() {
    let cpu = Cpu::current();
    let mut q = cpu.timers.lock();
    q.frozen = false;
    q.rearm();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::spinlock::Spinlock;
    use std::thread::sleep;
    use std::time::Duration;

    static ORDER: Spinlock<Vec<usize>> = Spinlock::new(Vec::new());

    fn record(arg: usize) {
        ORDER.lock().push(arg);
    }

    #[test]
    fn fires_in_deadline_order_not_insertion_order() {
        insert(5_000, 0, record, 1);
        insert(2_000, 0, record, 2);
        sleep(Duration::from_millis(40));
        let order = ORDER.lock().clone();
        assert_eq!(order, alloc::vec![2, 1]);
    }

    #[test]
    fn cancel_reports_remaining_and_suppresses_fire() {
        static HITS: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
        fn hit(_: usize) {
            HITS.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
        }

        let id = insert(100_000, 0, hit, 0);
        let remaining = cancel(id).expect("entry should still be queued");
        assert!(remaining > 0);
        assert!(remaining <= 100_000 * crate::arch::hal::ticks_per_us());
        assert_eq!(cancel(id), None);
        sleep(Duration::from_millis(20));
        assert_eq!(HITS.load(core::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn periodic_entry_refires_until_cancelled() {
        static HITS: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
        fn hit(_: usize) {
            HITS.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
        }

        let id = insert(2_000, 2_000, hit, 0);
        sleep(Duration::from_millis(50));
        let seen = HITS.load(core::sync::atomic::Ordering::SeqCst);
        assert!(seen >= 2, "periodic timer fired only {} times", seen);
        cancel(id);
        let after = HITS.load(core::sync::atomic::Ordering::SeqCst);
        sleep(Duration::from_millis(20));
        assert!(HITS.load(core::sync::atomic::Ordering::SeqCst) <= after + 1);
    }
}
