//! Current-thread accessors.

use crate::task::thread::Tid;

use super::SCHEDULER;

/// TID of the thread executing on the calling CPU.
///
/// On the hosted backend an OS thread that was never spawned through the
/// scheduler (a test body) is adopted into the table on first use, the
/// same way the boot context is adopted on bare metal.
#[cfg(target_os = "none")]
pub fn current_tid() -> Tid {
    let guard = SCHEDULER.lock();
    let cpu = crate::arch::hal::cpu_id();
    match guard.as_ref() {
        Some(sched) => sched.per_cpu[cpu].current_tid.unwrap_or(0),
        None => 0,
    }
}

#[cfg(not(target_os = "none"))]
pub fn current_tid() -> Tid {
    match crate::arch::hosted::current_tid() {
        Some(tid) => tid,
        None => adopt_current(),
    }
}

/// Bind the calling OS thread to a fresh thread record.
#[cfg(not(target_os = "none"))]
fn adopt_current() -> Tid {
    use crate::task::thread::{Thread, ThreadState};

    super::init();
    let tid = super::alloc_tid();
    let cpu = crate::arch::hosted::cpu_id();

    let mut thread = Thread::new(tid, |_| {}, 0, crate::config::DEFAULT_PRIORITY, "adopted");
    thread.state = ThreadState::Running;
    thread.affinity_cpu = cpu;
    thread.last_cpu = cpu;
    {
        let mut guard = SCHEDULER.lock();
        let sched = guard.as_mut().expect("scheduler not initialized");
        sched.threads.push(alloc::boxed::Box::new(thread));
    }
    crate::arch::hosted::register_parker(tid);
    crate::arch::hosted::set_current_tid(tid);
    tid
}

/// Name of the thread executing on the calling CPU.
pub fn current_thread_name() -> [u8; 32] {
    let tid = current_tid();
    let guard = SCHEDULER.lock();
    if let Some(sched) = guard.as_ref() {
        if let Some(idx) = sched.find_idx(tid) {
            return sched.threads[idx].name;
        }
    }
    [0u8; 32]
}

/// Whether a (non-reaped) thread with this TID exists.
pub fn thread_exists(tid: Tid) -> bool {
    let guard = SCHEDULER.lock();
    guard
        .as_ref()
        .map_or(false, |sched| sched.find_idx(tid).is_some())
}
