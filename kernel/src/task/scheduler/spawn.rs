//! Thread creation, exit, and join (the waitpid primitive).

use alloc::boxed::Box;

use crate::task::thread::{Thread, ThreadState, Tid, WakeReason};

use super::{alloc_tid, current_tid, wake_thread, SCHEDULER};

/// Create a kernel thread running `entry(arg)` and admit it.
pub fn spawn(entry: fn(usize), arg: usize, priority: u8, name: &str) -> Tid {
    super::init();
    let priority = priority.min((crate::config::NUM_PRIORITIES - 1) as u8);
    let tid = alloc_tid();

    // Box before taking the scheduler lock: the allocation must not
    // lengthen the critical section.
    #[allow(unused_mut)]
    let mut thread = Box::new(Thread::new(tid, entry, arg, priority, name));

    #[cfg(target_os = "none")]
    {
        let mut guard = SCHEDULER.lock();
        let sched = guard.as_mut().expect("scheduler not initialized");
        let cpu = sched.least_loaded_cpu();
        thread.affinity_cpu = cpu;
        thread.last_cpu = cpu;
        sched.threads.push(thread);
        let idx = sched.threads.len() - 1;
        sched.admit(idx);
    }

    #[cfg(not(target_os = "none"))]
    {
        {
            let mut guard = SCHEDULER.lock();
            let sched = guard.as_mut().expect("scheduler not initialized");
            sched.threads.push(thread);
        }
        let thread_name = name.to_string();
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let cpu = crate::arch::hosted::cpu_id();
                crate::arch::hosted::set_current_tid(tid);
                crate::arch::hosted::register_parker(tid);
                let entry_arg = {
                    let mut guard = SCHEDULER.lock();
                    let sched = guard.as_mut().expect("scheduler not initialized");
                    let idx = sched.find_idx(tid).expect("spawned thread not in table");
                    let t = &mut sched.threads[idx];
                    t.state = ThreadState::Running;
                    t.affinity_cpu = cpu;
                    t.last_cpu = cpu;
                    t.entry.take().expect("thread started twice")
                };
                (entry_arg.0)(entry_arg.1);
                exit_current(0);
            })
            .expect("failed to spawn kernel thread");
    }

    #[cfg(feature = "debug_verbose")]
    log::debug!("spawned '{}' (tid {})", name, tid);
    tid
}

/// Terminate the calling thread. Wakes a joiner if one is parked.
/// Never returns on bare metal.
pub fn exit_current(code: i32) {
    let tid = current_tid();
    let waiter = {
        let mut guard = SCHEDULER.lock();
        let sched = match guard.as_mut() {
            Some(s) => s,
            None => return,
        };
        let idx = match sched.find_idx(tid) {
            Some(i) => i,
            // Already reaped (double exit on the hosted backend).
            None => return,
        };
        let t = &mut sched.threads[idx];
        if t.state == ThreadState::Terminated {
            return;
        }
        t.state = ThreadState::Terminated;
        t.exit_code = Some(code);
        t.waiting_tid.take()
    };
    if let Some(w) = waiter {
        wake_thread(w, WakeReason::Normal);
    }

    #[cfg(target_os = "none")]
    {
        super::schedule();
        panic!("terminated thread rescheduled");
    }

    #[cfg(not(target_os = "none"))]
    crate::arch::hosted::deregister_parker(tid);
}

/// Block until `tid` terminates; returns its exit code and reaps the
/// record. `None` if no such thread (or joining self).
pub fn join(tid: Tid) -> Option<i32> {
    let me = current_tid();
    if tid == me {
        return None;
    }
    loop {
        {
            let mut guard = SCHEDULER.lock();
            let sched = guard.as_mut()?;
            let idx = sched.find_idx(tid)?;
            if sched.threads[idx].state == ThreadState::Terminated {
                let code = sched.threads[idx].exit_code.take().unwrap_or(0);
                // Reap unless some CPU still references the record.
                #[cfg(target_os = "none")]
                let still_current = sched
                    .per_cpu
                    .iter()
                    .any(|p| p.current_tid == Some(tid));
                #[cfg(not(target_os = "none"))]
                let still_current = false;
                if !still_current {
                    sched.threads.swap_remove(idx);
                }
                return Some(code);
            }
            sched.threads[idx].waiting_tid = Some(me);
            // Prepare inline (we already hold the lock): uninterruptible.
            let me_idx = sched.find_idx(me).expect("current thread not in table");
            let m = &mut sched.threads[me_idx];
            m.sleep_pending = true;
            m.interruptible = false;
            m.wake_reason = None;
        }
        super::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static RAN: AtomicUsize = AtomicUsize::new(0);

    fn worker(arg: usize) {
        RAN.fetch_add(arg, Ordering::SeqCst);
        exit_current(7);
    }

    #[test]
    fn join_returns_exit_code_and_reaps() {
        let tid = spawn(worker, 5, 40, "worker");
        assert_eq!(join(tid), Some(7));
        assert_eq!(RAN.load(Ordering::SeqCst), 5);
        assert!(!super::super::thread_exists(tid));
        // A second join finds nothing.
        assert_eq!(join(tid), None);
    }

    #[test]
    fn migrate_to_retags_cpu() {
        let target = (crate::arch::hal::cpu_id() + 1) % crate::config::MAX_CPUS;
        super::super::migrate_to(target);
        assert_eq!(crate::arch::hal::cpu_id(), target);
    }
}
