//! Preemptive scheduler with per-CPU priority run queues.
//!
//! The thread table and the per-CPU queues live behind one scheduler
//! spinlock; threads are boxed for pointer stability across table growth.
//! Blocking is a two-phase protocol (`prepare_sleep` then `yield_now`)
//! arbitrated by the per-thread wake-reason cell: the first waker to
//! reach a prepared or sleeping thread deposits the reason, so a wakeup
//! that races the descheduling is never lost.
//!
//! On bare metal a thread that yields is context-switched out with the
//! scheduler lock held across the switch; the thread that gains the CPU
//! releases it. On the hosted backend threads are OS threads and the
//! switch is a park/unpark pair, with identical table state transitions.

mod accessors;
mod run_queue;
mod spawn;
mod wait;

pub use accessors::*;
pub use spawn::*;
pub use wait::*;

pub use crate::task::thread::WakeReason;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::config::MAX_CPUS;
use crate::sync::spinlock::Spinlock;
use crate::task::thread::{Thread, Tid};

#[cfg(target_os = "none")]
use crate::task::thread::ThreadState;

use run_queue::RunQueue;

/// Per-CPU scheduling state.
#[cfg_attr(not(target_os = "none"), allow(dead_code))]
struct PerCpu {
    /// TID of the thread currently executing on this CPU, or None before
    /// the CPU enters the scheduler.
    current_tid: Option<Tid>,
    /// Ready threads assigned to this CPU.
    run_queue: RunQueue,
}

pub(crate) struct Scheduler {
    /// All threads known to the scheduler (any state). Boxed so records
    /// keep their address while the table grows.
    threads: Vec<Box<Thread>>,
    #[cfg_attr(not(target_os = "none"), allow(dead_code))]
    per_cpu: Vec<PerCpu>,
    /// Per-CPU idle thread TIDs; always valid, never reaped (bare metal).
    #[cfg(target_os = "none")]
    idle_tid: [Tid; MAX_CPUS],
}

static SCHEDULER: Spinlock<Option<Scheduler>> = Spinlock::new(None);
static ONLINE: AtomicBool = AtomicBool::new(false);
static NEXT_TID: AtomicU32 = AtomicU32::new(1);

pub(super) fn alloc_tid() -> Tid {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

impl Scheduler {
    /// Find a thread's index by TID. O(n) linear scan.
    fn find_idx(&self, tid: Tid) -> Option<usize> {
        self.threads.iter().position(|t| t.tid == tid)
    }

    /// Put a Ready thread on a run queue, honoring a transient pin over
    /// the affinity CPU. The hosted backend has no run queues (the host
    /// OS schedules its threads), so this is a no-op there.
    #[cfg(target_os = "none")]
    fn admit(&mut self, idx: usize) {
        let (tid, priority, cpu) = {
            let t = &self.threads[idx];
            let cpu = t.pinned_cpu.unwrap_or(t.affinity_cpu);
            let n = crate::arch::hal::cpu_count();
            (t.tid, t.priority, if cpu < n { cpu } else { 0 })
        };
        self.per_cpu[cpu].run_queue.enqueue(tid, priority);
    }

    #[cfg(not(target_os = "none"))]
    fn admit(&mut self, _idx: usize) {}

    /// Pick the CPU with the shortest ready queue for initial placement.
    #[cfg(target_os = "none")]
    fn least_loaded_cpu(&self) -> usize {
        let n = crate::arch::hal::cpu_count();
        let mut best = 0;
        let mut best_len = usize::MAX;
        for cpu in 0..n {
            let len = self.per_cpu[cpu].run_queue.total_count();
            if len < best_len {
                best_len = len;
                best = cpu;
            }
        }
        best
    }
}

/// Initialize the global scheduler. Idempotent; the first caller wins.
pub fn init() {
    let mut guard = SCHEDULER.lock();
    if guard.is_some() {
        return;
    }
    let mut per_cpu = Vec::with_capacity(MAX_CPUS);
    for _ in 0..MAX_CPUS {
        per_cpu.push(PerCpu { current_tid: None, run_queue: RunQueue::new() });
    }

    #[allow(unused_mut)]
    let mut sched = Scheduler {
        threads: Vec::with_capacity(64),
        per_cpu,
        #[cfg(target_os = "none")]
        idle_tid: [0; MAX_CPUS],
    };

    // Per-CPU idle threads, priority 0. The boot CPU starts out running
    // its idle thread; APs pick theirs up on their first schedule().
    #[cfg(target_os = "none")]
    for cpu in 0..MAX_CPUS {
        let tid = alloc_tid();
        let mut thread = Thread::new(tid, idle_entry, 0, 0, "idle");
        thread.is_idle = true;
        thread.affinity_cpu = cpu;
        thread.last_cpu = cpu;
        if cpu == 0 {
            thread.state = ThreadState::Running;
            sched.per_cpu[0].current_tid = Some(tid);
        }
        sched.idle_tid[cpu] = tid;
        sched.threads.push(Box::new(thread));
    }

    *guard = Some(sched);
    drop(guard);
    ONLINE.store(true, Ordering::Release);
    log::info!("scheduler online ({} priority levels, {} CPUs max)", crate::config::NUM_PRIORITIES, MAX_CPUS);
}

/// True once a scheduling context exists; before that, blocking
/// primitives degrade to spinning.
pub fn is_online() -> bool {
    ONLINE.load(Ordering::Acquire)
}

#[cfg(target_os = "none")]
fn idle_entry(_: usize) {
    loop {
        crate::arch::hal::enable_interrupts();
        crate::arch::hal::halt();
    }
}

// =============================================================================
// Bare-metal context switching
// =============================================================================

/// Voluntarily give up the CPU (the current thread stays Ready).
#[cfg(target_os = "none")]
pub fn schedule() {
    schedule_inner(false);
}

/// Preemption entry, called from the clock path. Non-blocking: if the
/// scheduler lock is contended the tick is simply skipped.
#[cfg(target_os = "none")]
pub fn schedule_tick() {
    schedule_inner(true);
}

#[cfg(target_os = "none")]
static mut SCRATCH_CTX: [crate::arch::x86::context::CpuContext; MAX_CPUS] =
    [const { crate::arch::x86::context::CpuContext { rsp: 0 } }; MAX_CPUS];

#[cfg(target_os = "none")]
fn schedule_inner(from_timer: bool) {
    use crate::arch::hal;
    use crate::arch::x86::context::CpuContext;

    let flags = hal::save_and_disable_interrupts();
    let cpu_id = hal::cpu_id();

    let mut guard = if from_timer {
        match SCHEDULER.try_lock() {
            Some(g) => g,
            None => {
                hal::restore_interrupt_state(flags);
                return;
            }
        }
    } else {
        SCHEDULER.lock()
    };
    let sched = match guard.as_mut() {
        Some(s) => s,
        None => {
            drop(guard);
            hal::restore_interrupt_state(flags);
            return;
        }
    };

    let idle_tid = sched.idle_tid[cpu_id];
    let outgoing_tid = sched.per_cpu[cpu_id].current_tid;
    let outgoing_idx = outgoing_tid.and_then(|t| sched.find_idx(t));

    // A still-Running outgoing thread goes back to its queue; a thread
    // that marked itself Sleeping or Terminated does not.
    if let Some(idx) = outgoing_idx {
        if sched.threads[idx].state == ThreadState::Running && !sched.threads[idx].is_idle {
            sched.threads[idx].state = ThreadState::Ready;
            sched.threads[idx].last_cpu = cpu_id;
            sched.admit(idx);
        }
    }

    // Pick the best ready thread for this CPU, falling back to idle.
    let next_tid = loop {
        match sched.per_cpu[cpu_id].run_queue.dequeue_highest() {
            Some(tid) => match sched.find_idx(tid) {
                Some(i) if sched.threads[i].state == ThreadState::Ready => break tid,
                // Stale id (reaped or state changed); keep looking.
                _ => continue,
            },
            None => break idle_tid,
        }
    };

    let next_idx = sched.find_idx(next_tid).expect("picked thread vanished");
    sched.threads[next_idx].state = ThreadState::Running;
    sched.threads[next_idx].last_cpu = cpu_id;
    sched.per_cpu[cpu_id].current_tid = Some(next_tid);

    if outgoing_tid == Some(next_tid) {
        drop(guard);
        hal::restore_interrupt_state(flags);
        return;
    }

    let old_ctx: *mut CpuContext = match outgoing_idx {
        Some(i) => &mut sched.threads[i].context,
        // First entry on this CPU: the outgoing context is discarded.
        None => unsafe { core::ptr::addr_of_mut!(SCRATCH_CTX[cpu_id]) },
    };
    let new_ctx: *const CpuContext = &sched.threads[next_idx].context;

    // CRITICAL: hold the scheduler lock across the switch. The outgoing
    // context is not fully saved until switch() completes, and any waker
    // that would re-queue this thread must serialize behind the lock.
    // Whoever gains the CPU (below, or thread_trampoline for a fresh
    // thread) releases it.
    core::mem::forget(guard);
    unsafe {
        crate::arch::x86::context::switch(&mut *old_ctx, &*new_ctx);
        SCHEDULER.force_unlock();
    }
    hal::restore_interrupt_state(flags);
}

/// First activation of a fresh thread: release the handoff lock, drop to
/// thread context, run the entry function.
#[cfg(target_os = "none")]
pub extern "C" fn thread_trampoline() -> ! {
    unsafe {
        SCHEDULER.force_unlock();
    }
    crate::arch::hal::enable_interrupts();

    let (entry, arg) = {
        let tid = current_tid();
        let mut guard = SCHEDULER.lock();
        let sched = guard.as_mut().expect("scheduler gone during thread start");
        let idx = sched.find_idx(tid).expect("starting thread not in table");
        sched.threads[idx].entry.take().expect("thread started twice")
    };
    entry(arg);
    exit_current(0);
    unreachable!()
}
