//! Sleep/wake primitives: the two-phase blocking protocol, CPU pinning,
//! cooperative migration, and the timer-driven forced wakeup.

use crate::arch::hal;
use crate::error::Result;
use crate::irq::dpc::{self, DeferredCall, DpcToken};
use crate::task::thread::{ThreadState, Tid, WakeReason};
use crate::time::timer::{self, TimerId};

use super::{current_tid, SCHEDULER};

/// Mark the current thread as about to block.
///
/// Must be called before releasing the object lock that decided to
/// block; any waker that runs afterwards finds `sleep_pending` set and
/// deposits its reason, so `yield_now` returns without sleeping.
pub fn prepare_sleep(interruptible: bool) {
    let tid = current_tid();
    let mut guard = SCHEDULER.lock();
    let sched = guard.as_mut().expect("scheduler not initialized");
    let idx = sched.find_idx(tid).expect("current thread not in table");
    let t = &mut sched.threads[idx];
    t.sleep_pending = true;
    t.interruptible = interruptible;
    t.wake_reason = None;
    // A signal that arrived while we were not sleeping aborts the wait
    // before it starts.
    if interruptible && t.interrupt_pending {
        t.interrupt_pending = false;
        t.wake_reason = Some(WakeReason::Interrupted);
    }
}

/// Give up the CPU until a waker deposits a reason; returns that reason.
///
/// If a reason is already present (the wakeup won the race against the
/// deschedule), returns immediately. On return the thread is Running on
/// its pinned CPU if a pin is set.
pub fn yield_now() -> WakeReason {
    let tid = current_tid();
    loop {
        {
            let mut guard = SCHEDULER.lock();
            let sched = guard.as_mut().expect("scheduler not initialized");
            let idx = sched.find_idx(tid).expect("current thread not in table");
            let t = &mut sched.threads[idx];
            if let Some(reason) = t.wake_reason.take() {
                t.sleep_pending = false;
                t.state = ThreadState::Running;
                let pin = t.pinned_cpu;
                drop(guard);
                finish_wake(pin);
                return reason;
            }
            t.state = ThreadState::Sleeping;
        }

        #[cfg(not(target_os = "none"))]
        crate::arch::hosted::park_current();

        #[cfg(target_os = "none")]
        super::schedule();
    }
}

/// Post-wake fixup: land the thread on its pinned CPU. On bare metal the
/// waker already queued us there; on the hosted backend the OS thread
/// retags itself.
fn finish_wake(pin: Option<usize>) {
    #[cfg(not(target_os = "none"))]
    if let Some(cpu) = pin {
        crate::arch::hosted::set_cpu(cpu);
    }
    #[cfg(target_os = "none")]
    let _ = pin;
}

/// Move a Sleeping (or prepared) thread towards Running, recording why.
///
/// The first waker wins the reason cell; later wakers of the same sleep
/// cycle are no-ops. Waking a thread that is neither sleeping nor
/// prepared is a no-op (the wake was consumed by an abort path).
pub fn wake_thread(tid: Tid, reason: WakeReason) {
    let mut unpark = false;
    {
        let mut guard = SCHEDULER.lock();
        let sched = match guard.as_mut() {
            Some(s) => s,
            None => return,
        };
        let idx = match sched.find_idx(tid) {
            Some(i) => i,
            None => return,
        };
        let mut admit = false;
        {
            let t = &mut sched.threads[idx];
            match t.state {
                ThreadState::Sleeping => {
                    if t.wake_reason.is_none() {
                        t.wake_reason = Some(reason);
                    }
                    t.sleep_pending = false;
                    t.state = ThreadState::Ready;
                    admit = true;
                    unpark = true;
                }
                _ if t.sleep_pending => {
                    // Prepared but still on its CPU; the pending reason
                    // makes its yield return immediately.
                    if t.wake_reason.is_none() {
                        t.wake_reason = Some(reason);
                    }
                }
                _ => {}
            }
        }
        if admit {
            sched.admit(idx);
        }
    }
    #[cfg(not(target_os = "none"))]
    if unpark {
        crate::arch::hosted::unpark(tid);
    }
    #[cfg(target_os = "none")]
    let _ = unpark;
}

/// Signal-style abort of an interruptible sleep.
///
/// A thread in (or entering) an interruptible sleep wakes with
/// `WakeReason::Interrupted`; otherwise the interrupt is left pending
/// and delivered at the thread's next interruptible `prepare_sleep`.
pub fn interrupt_thread(tid: Tid) {
    let mut unpark = false;
    {
        let mut guard = SCHEDULER.lock();
        let sched = match guard.as_mut() {
            Some(s) => s,
            None => return,
        };
        let idx = match sched.find_idx(tid) {
            Some(i) => i,
            None => return,
        };
        let mut admit = false;
        {
            let t = &mut sched.threads[idx];
            let sleeping = t.state == ThreadState::Sleeping;
            if (sleeping || t.sleep_pending) && t.interruptible {
                if t.wake_reason.is_none() {
                    t.wake_reason = Some(WakeReason::Interrupted);
                }
                if sleeping {
                    t.sleep_pending = false;
                    t.state = ThreadState::Ready;
                    admit = true;
                    unpark = true;
                }
            } else {
                t.interrupt_pending = true;
            }
        }
        if admit {
            sched.admit(idx);
        }
    }
    #[cfg(not(target_os = "none"))]
    if unpark {
        crate::arch::hosted::unpark(tid);
    }
    #[cfg(target_os = "none")]
    let _ = unpark;
}

/// Unwind a `prepare_sleep` that will not reach `yield_now` (an arming
/// step failed). Clears the prepared state so a stale waker cannot
/// poison the thread's next wait cycle.
pub(crate) fn abort_sleep() {
    let tid = current_tid();
    let mut guard = SCHEDULER.lock();
    if let Some(sched) = guard.as_mut() {
        if let Some(idx) = sched.find_idx(tid) {
            let t = &mut sched.threads[idx];
            t.sleep_pending = false;
            t.wake_reason = None;
        }
    }
}

/// Admit a Ready thread to its CPU's ready queue.
pub fn queue_thread(tid: Tid) {
    let mut guard = SCHEDULER.lock();
    let sched = match guard.as_mut() {
        Some(s) => s,
        None => return,
    };
    if let Some(idx) = sched.find_idx(tid) {
        if sched.threads[idx].state == ThreadState::Ready {
            sched.admit(idx);
        }
    }
}

/// Pin the current thread's next wakeups to `cpu`. Used by timed waits:
/// the timer entry lives in `cpu`'s queue and must be torn down there.
pub fn pin_to_cpu(cpu: usize) {
    let tid = current_tid();
    let mut guard = SCHEDULER.lock();
    if let Some(sched) = guard.as_mut() {
        if let Some(idx) = sched.find_idx(tid) {
            sched.threads[idx].pinned_cpu = Some(cpu);
        }
    }
}

/// Drop the transient pin set by [`pin_to_cpu`].
pub fn clear_pin() {
    let tid = current_tid();
    let mut guard = SCHEDULER.lock();
    if let Some(sched) = guard.as_mut() {
        if let Some(idx) = sched.find_idx(tid) {
            sched.threads[idx].pinned_cpu = None;
        }
    }
}

/// Cooperatively move the current thread onto `cpu` and return running
/// there. This is the only sanctioned way to touch another CPU's timer
/// or DPC state: migrate, then operate locally.
pub fn migrate_to(cpu: usize) {
    assert!(cpu < crate::config::MAX_CPUS, "migrate_to({}): no such CPU", cpu);
    if hal::cpu_id() == cpu {
        return;
    }
    let tid = current_tid();
    {
        let mut guard = SCHEDULER.lock();
        if let Some(sched) = guard.as_mut() {
            if let Some(idx) = sched.find_idx(tid) {
                let t = &mut sched.threads[idx];
                t.affinity_cpu = cpu;
                t.pinned_cpu = Some(cpu);
            }
        }
    }

    #[cfg(target_os = "none")]
    loop {
        super::schedule();
        if hal::cpu_id() == cpu {
            break;
        }
    }

    #[cfg(not(target_os = "none"))]
    crate::arch::hosted::set_cpu(cpu);

    clear_pin();
}

// =============================================================================
// Timer-driven forced wakeup
// =============================================================================

/// A one-shot "wake `tid` with `TimedOut`" armed on the calling CPU.
///
/// Used by timed semaphore waits; the poll subsystem has its own variant
/// that claims the descriptor first. The caller is pinned to the arming
/// CPU until [`WakeTimer::cancel`] so the teardown runs on the queue's
/// owner.
pub(crate) struct WakeTimer {
    timer: TimerId,
    dpc: DeferredCall,
}

impl WakeTimer {
    pub(crate) fn arm(tid: Tid, us: u64) -> Result<WakeTimer> {
        pin_to_cpu(hal::cpu_id());
        let dpc = match DeferredCall::new() {
            Ok(d) => d,
            Err(e) => {
                clear_pin();
                return Err(e);
            }
        };
        let arg = dpc.token().pack(tid);
        let timer = timer::insert(us, 0, wake_timer_fire, arg);
        Ok(WakeTimer { timer, dpc })
    }

    pub(crate) fn cancel(mut self) {
        timer::cancel(self.timer);
        // Retire rather than dequeue: a fire caught between the
        // comparator and the DPC queue holds a now-stale token.
        dpc::retire(&mut self.dpc);
        clear_pin();
    }
}

fn wake_timer_fire(arg: usize) {
    // Clock priority: push the actual wake down to DPC level. A stale
    // token (the wait already tore down) enqueues nothing.
    let (token, _) = DpcToken::unpack(arg);
    dpc::enqueue_token(token, wake_timer_body, arg);
}

fn wake_timer_body(arg: usize) {
    let (_, tid) = DpcToken::unpack(arg);
    wake_thread(tid, WakeReason::TimedOut);
}
