//! Local APIC: CPU identity, task priority, EOI, IPIs, and the one-shot
//! timer that backs each CPU's timer queue.
//!
//! The APIC timer is programmed in one-shot mode with divider 1; the
//! tick-per-microsecond rate is calibrated against the PIT during boot
//! (boot glue is outside this crate) and published via [`set_ticks_per_us`].

use core::sync::atomic::{AtomicU64, Ordering};

/// Identity-mapped default local APIC MMIO base.
const LAPIC_BASE: u64 = 0xFEE0_0000;

const REG_ID: u64 = 0x020;
const REG_TPR: u64 = 0x080;
const REG_EOI: u64 = 0x0B0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INIT: u64 = 0x380;
const REG_TIMER_CURRENT: u64 = 0x390;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

const LVT_MASKED: u32 = 1 << 16;
/// Divide-by-1 encoding for the timer divide configuration register.
const DIVIDE_BY_1: u32 = 0b1011;

/// Calibrated APIC timer ticks per microsecond (set once during boot).
static TICKS_PER_US: AtomicU64 = AtomicU64::new(10);

#[inline]
unsafe fn read(reg: u64) -> u32 {
    core::ptr::read_volatile((LAPIC_BASE + reg) as *const u32)
}

#[inline]
unsafe fn write(reg: u64, value: u32) {
    core::ptr::write_volatile((LAPIC_BASE + reg) as *mut u32, value);
}

/// Local APIC ID of the calling CPU.
pub fn id() -> u32 {
    unsafe { read(REG_ID) >> 24 }
}

/// Record the boot-time timer calibration result.
pub fn set_ticks_per_us(ticks: u64) {
    TICKS_PER_US.store(ticks.max(1), Ordering::Relaxed);
}

pub fn ticks_per_us() -> u64 {
    TICKS_PER_US.load(Ordering::Relaxed)
}

/// Mirror the software IPL into the task-priority register so interrupt
/// classes at or below the ceiling stay pending in hardware.
pub fn set_task_priority(level: u8) {
    unsafe { write(REG_TPR, (level as u32) << 4) }
}

/// Signal end-of-interrupt for the in-service vector.
pub fn end_of_interrupt() {
    unsafe { write(REG_EOI, 0) }
}

/// Send `vector` to `cpu` as a fixed IPI. Sending to the calling CPU is
/// how the DPC software trigger is raised.
pub fn send_ipi(cpu: usize, vector: u8) {
    unsafe {
        write(REG_ICR_HIGH, (cpu as u32) << 24);
        write(REG_ICR_LOW, vector as u32 | (1 << 14)); // assert, fixed delivery
        while read(REG_ICR_LOW) & (1 << 12) != 0 {
            core::hint::spin_loop();
        }
    }
}

/// Arm the one-shot timer `ticks` from now, replacing any armed deadline.
pub fn timer_arm(ticks: u64) {
    let count = ticks.min(u32::MAX as u64) as u32;
    unsafe {
        write(REG_TIMER_DIVIDE, DIVIDE_BY_1);
        write(REG_LVT_TIMER, crate::irq::CLOCK_VECTOR as u32);
        write(REG_TIMER_INIT, count.max(1));
    }
}

/// Stop the timer; returns the unexpired ticks (0 if it already fired).
pub fn timer_stop() -> u64 {
    unsafe {
        let remaining = read(REG_TIMER_CURRENT) as u64;
        write(REG_LVT_TIMER, LVT_MASKED);
        write(REG_TIMER_INIT, 0);
        remaining
    }
}
