//! SMP identity: which CPU am I, how many are online.
//!
//! CPU ids are local APIC ids, assumed dense from 0 (true on QEMU and on
//! every board this kernel has met). AP bring-up itself is boot glue and
//! lives outside this crate; it reports the final core count here.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::MAX_CPUS;

static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

/// ID of the calling CPU.
#[inline]
pub fn current_cpu_id() -> usize {
    let id = super::apic::id() as usize;
    if id < MAX_CPUS {
        id
    } else {
        0
    }
}

/// Number of online CPUs (at least 1).
#[inline]
pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Relaxed)
}

/// Record the number of CPUs that finished bring-up.
pub fn set_cpu_count(count: usize) {
    CPU_COUNT.store(count.clamp(1, MAX_CPUS), Ordering::Relaxed);
}
