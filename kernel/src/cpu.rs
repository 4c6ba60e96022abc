//! Per-CPU records.
//!
//! One `Cpu` per core, live for the lifetime of the machine, accessed only
//! through [`Cpu::current`] / [`Cpu::by_id`]. Everything a core owns
//! exclusively hangs off this record: the IPL ceiling, the DPC queue and
//! pending flag, and the timer queue. The owning-CPU-only mutation rules
//! for those queues are enforced at their modules' entry points.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use alloc::vec::Vec;

use crate::arch::hal;
use crate::config::MAX_CPUS;
use crate::sync::spinlock::Spinlock;
use crate::time::timer::TimerQueue;

/// Per-core record. Never moved, never dropped.
pub struct Cpu {
    /// Current interrupt priority ceiling (see `irq::ipl`).
    pub(crate) ipl: AtomicU8,
    /// Set when the DPC queue is non-empty and a dispatch is owed.
    pub(crate) dpc_pending: AtomicBool,
    /// LIFO dispatch list of deferred-call slot ids.
    pub(crate) dpc_queue: Spinlock<Vec<u32>>,
    /// This core's timer queue, backing the one hardware comparator.
    pub(crate) timers: Spinlock<TimerQueue>,
}

static CPUS: [Cpu; MAX_CPUS] = [const { Cpu::new() }; MAX_CPUS];

impl Cpu {
    const fn new() -> Self {
        Cpu {
            ipl: AtomicU8::new(0),
            dpc_pending: AtomicBool::new(false),
            dpc_queue: Spinlock::new(Vec::new()),
            timers: Spinlock::new(TimerQueue::new()),
        }
    }

    /// The record of the CPU this code is executing on.
    #[inline]
    pub fn current() -> &'static Cpu {
        &CPUS[hal::cpu_id()]
    }

    /// The record of a specific CPU.
    #[inline]
    pub fn by_id(id: usize) -> &'static Cpu {
        &CPUS[id]
    }

    /// Index of this record in the CPU table (== its CPU id).
    #[inline]
    pub fn index(&self) -> usize {
        (self as *const Cpu as usize - CPUS.as_ptr() as usize) / core::mem::size_of::<Cpu>()
    }

    #[inline]
    pub(crate) fn ipl_raw(&self) -> u8 {
        self.ipl.load(Ordering::Relaxed)
    }
}
