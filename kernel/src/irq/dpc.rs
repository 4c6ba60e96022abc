//! Deferred procedure calls.
//!
//! Interrupt handlers hand non-trivial work to their CPU's DPC queue; the
//! dispatcher drains it at `Ipl::Dpc`, below every interrupt source but
//! above normal threads. Call slots live in a fixed slab so that queue
//! membership is an id, not a pointer; a [`DeferredCall`] handle owns one
//! slot for as long as the owning object lives.
//!
//! Lifecycle of a slot: Idle -> Enqueued -> Running -> Idle, or back to
//! Enqueued if the body re-arms itself. Dropping a handle while its slot
//! is still enqueued is a fatal programming error.

use core::sync::atomic::Ordering;

use super::ipl::{self, Ipl};
use crate::arch::hal;
use crate::config::MAX_DPCS;
use crate::cpu::Cpu;
use crate::error::{KernelError, Result};
use crate::sync::spinlock::Spinlock;

/// A deferred-call body. Runs at `Ipl::Dpc` with interrupts enabled.
pub type DpcFn = fn(usize);

struct DpcSlot {
    live: bool,
    enqueued: bool,
    /// Bumped on every allocation so a stale id from a racing timer fire
    /// can never enqueue a recycled slot.
    generation: u16,
    func: Option<DpcFn>,
    arg: usize,
    queued_cpu: usize,
}

impl DpcSlot {
    const fn idle() -> Self {
        DpcSlot {
            live: false,
            enqueued: false,
            generation: 0,
            func: None,
            arg: 0,
            queued_cpu: 0,
        }
    }
}

static SLOTS: Spinlock<[DpcSlot; MAX_DPCS]> = Spinlock::new([const { DpcSlot::idle() }; MAX_DPCS]);

/// Owning handle to one deferred-call slot.
pub struct DeferredCall {
    slot: u32,
    generation: u16,
}

impl DeferredCall {
    /// Allocate a slot. Fails with `Exhausted` when the slab is full.
    pub fn new() -> Result<DeferredCall> {
        let mut slots = SLOTS.lock();
        for (i, s) in slots.iter_mut().enumerate() {
            if !s.live {
                let generation = s.generation.wrapping_add(1);
                *s = DpcSlot { live: true, generation, ..DpcSlot::idle() };
                return Ok(DeferredCall { slot: i as u32, generation });
            }
        }
        Err(KernelError::Exhausted)
    }

    /// `(slot, generation)` reference for callers that must name this DPC
    /// across an interrupt boundary (timer callbacks).
    pub(crate) fn token(&self) -> DpcToken {
        DpcToken { slot: self.slot, generation: self.generation }
    }
}

/// Weak reference to a slot, validated on use.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DpcToken {
    slot: u32,
    generation: u16,
}

impl DpcToken {
    /// Pack into a timer-callback argument together with 32 bits of payload.
    pub(crate) fn pack(self, payload: u32) -> usize {
        ((self.slot as usize) << 48) | ((self.generation as usize) << 32) | payload as usize
    }

    /// Inverse of [`DpcToken::pack`].
    pub(crate) fn unpack(raw: usize) -> (DpcToken, u32) {
        (
            DpcToken { slot: (raw >> 48) as u32, generation: (raw >> 32) as u16 },
            raw as u32,
        )
    }
}

impl Drop for DeferredCall {
    fn drop(&mut self) {
        let mut slots = SLOTS.lock();
        let s = &mut slots[self.slot as usize];
        // An enqueued slot still has a queue entry pointing at it; freeing
        // it now would hand the dispatcher a recycled slot.
        assert!(!s.enqueued, "DeferredCall dropped while enqueued");
        s.live = false;
        s.func = None;
    }
}

/// Queue `dpc` on the calling CPU. If it is already enqueued this is a
/// no-op and the original `func`/`arg` win.
pub fn enqueue(dpc: &DeferredCall, func: DpcFn, arg: usize) {
    enqueue_token(dpc.token(), func, arg);
}

/// Token variant for callers racing against the handle's owner (timer
/// fire paths). Returns false when the token is stale or the slot is
/// already enqueued.
pub(crate) fn enqueue_token(token: DpcToken, func: DpcFn, arg: usize) -> bool {
    let cpu = Cpu::current();
    {
        let mut slots = SLOTS.lock();
        let s = match slots.get_mut(token.slot as usize) {
            Some(s) => s,
            None => return false,
        };
        if !s.live || s.generation != token.generation || s.enqueued {
            return false;
        }
        s.enqueued = true;
        s.func = Some(func);
        s.arg = arg;
        s.queued_cpu = cpu.index();
        cpu.dpc_queue.lock().push(token.slot);
        cpu.dpc_pending.store(true, Ordering::Release);
    }
    hal::request_dpc_dispatch(cpu.index());
    true
}

/// Unlink `dpc` if enqueued and invalidate every token handed out so
/// far; a timer fire still in flight with an old token can no longer
/// enqueue this slot. Used when tearing down a timed wait. Returns true
/// if a queue entry was removed.
pub(crate) fn retire(dpc: &mut DeferredCall) -> bool {
    let mut slots = SLOTS.lock();
    let s = &mut slots[dpc.slot as usize];
    let was_enqueued = s.enqueued;
    if was_enqueued {
        assert_eq!(
            s.queued_cpu,
            hal::cpu_id(),
            "DPC retired from a CPU that does not own it"
        );
        s.enqueued = false;
        let cpu = Cpu::by_id(s.queued_cpu);
        let mut queue = cpu.dpc_queue.lock();
        if let Some(pos) = queue.iter().position(|&id| id == dpc.slot) {
            queue.remove(pos);
        }
    }
    s.generation = s.generation.wrapping_add(1);
    dpc.generation = s.generation;
    was_enqueued
}

/// Unlink `dpc` from its dispatch list if it is enqueued. Safe to call on
/// an idle DPC. Must run on the CPU that queued it.
pub fn dequeue(dpc: &DeferredCall) -> bool {
    let mut slots = SLOTS.lock();
    let s = &mut slots[dpc.slot as usize];
    if !s.enqueued {
        return false;
    }
    assert_eq!(
        s.queued_cpu,
        hal::cpu_id(),
        "DPC dequeued from a CPU that does not own it"
    );
    s.enqueued = false;
    let cpu = Cpu::by_id(s.queued_cpu);
    let mut queue = cpu.dpc_queue.lock();
    if let Some(pos) = queue.iter().position(|&id| id == dpc.slot) {
        queue.remove(pos);
    }
    true
}

/// Drain the calling CPU's DPC queue at `Ipl::Dpc`.
///
/// Dispatch order is LIFO by construction (the list is a stack); nothing
/// may depend on FIFO here. Each slot's enqueued flag is cleared before
/// its body runs, so the body may legally re-enqueue itself. The body
/// itself runs with no locks held and interrupts enabled.
pub fn dispatch_pending() {
    let cpu = Cpu::current();
    let old = ipl::raise(Ipl::Dpc);
    loop {
        let next = {
            let mut queue = cpu.dpc_queue.lock();
            match queue.pop() {
                Some(id) => id,
                None => {
                    cpu.dpc_pending.store(false, Ordering::Release);
                    break;
                }
            }
        };
        let body = {
            let mut slots = SLOTS.lock();
            let s = &mut slots[next as usize];
            if s.enqueued {
                s.enqueued = false;
                Some((s.func.expect("enqueued DPC slot without a body"), s.arg))
            } else {
                // Raced with dequeue() after we popped the id.
                None
            }
        };
        if let Some((func, arg)) = body {
            func(arg);
        }
    }
    ipl::lower(old);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static FIRST_HITS: AtomicUsize = AtomicUsize::new(0);
    static SECOND_HITS: AtomicUsize = AtomicUsize::new(0);
    static LAST_ARG: AtomicUsize = AtomicUsize::new(0);

    fn first(arg: usize) {
        FIRST_HITS.fetch_add(1, Ordering::SeqCst);
        LAST_ARG.store(arg, Ordering::SeqCst);
    }

    fn second(arg: usize) {
        SECOND_HITS.fetch_add(1, Ordering::SeqCst);
        LAST_ARG.store(arg, Ordering::SeqCst);
    }

    #[test]
    fn coalesces_double_enqueue_first_wins() {
        let dpc = DeferredCall::new().unwrap();
        // Hold the IPL at Dpc so nothing dispatches between the two enqueues.
        let old = ipl::raise(Ipl::Dpc);
        enqueue(&dpc, first, 11);
        enqueue(&dpc, second, 22);
        ipl::lower(old);
        dispatch_pending();

        assert_eq!(FIRST_HITS.load(Ordering::SeqCst), 1);
        assert_eq!(SECOND_HITS.load(Ordering::SeqCst), 0);
        assert_eq!(LAST_ARG.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn dequeue_is_safe_on_idle_and_removes_enqueued() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn body(_: usize) {
            HITS.fetch_add(1, Ordering::SeqCst);
        }

        let dpc = DeferredCall::new().unwrap();
        assert!(!dequeue(&dpc));

        let old = ipl::raise(Ipl::Dpc);
        enqueue(&dpc, body, 0);
        assert!(dequeue(&dpc));
        assert!(!dequeue(&dpc));
        ipl::lower(old);
        dispatch_pending();
        assert_eq!(HITS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn body_may_rearm_itself() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);

        fn body(arg: usize) {
            if RUNS.fetch_add(1, Ordering::SeqCst) == 0 {
                let (token, _) = DpcToken::unpack(arg);
                enqueue_token(token, body, arg);
            }
        }

        let dpc = DeferredCall::new().unwrap();
        let old = ipl::raise(Ipl::Dpc);
        enqueue(&dpc, body, dpc.token().pack(0));
        ipl::lower(old);
        dispatch_pending();
        assert_eq!(RUNS.load(Ordering::SeqCst), 2);
    }
}
