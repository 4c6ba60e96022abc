//! Hardware Abstraction Layer — platform-agnostic API.
//!
//! Free functions with `cfg`-gated forwarding to the active backend. All
//! cross-platform kernel code goes through `arch::hal::*` and never
//! references `arch::x86::*` or `arch::hosted::*` directly.
//!
//! Two backends exist: the bare-metal x86-64 one (inline asm, local APIC)
//! and the hosted one used by `cargo test`, which models CPUs as tagged OS
//! threads and the one-shot comparator as a monotonic-clock watcher.

// =============================================================================
// CPU identity
// =============================================================================

/// Get the current CPU's ID (always accurate, even after migration).
#[cfg(target_os = "none")]
#[inline]
pub fn cpu_id() -> usize {
    crate::arch::x86::smp::current_cpu_id()
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn cpu_id() -> usize {
    crate::arch::hosted::cpu_id()
}

/// Number of online CPUs (at least 1).
#[cfg(target_os = "none")]
#[inline]
pub fn cpu_count() -> usize {
    crate::arch::x86::smp::cpu_count()
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn cpu_count() -> usize {
    crate::config::MAX_CPUS
}

// =============================================================================
// Local interrupt state
// =============================================================================

/// Enable interrupts on the current CPU.
#[cfg(target_os = "none")]
#[inline]
pub fn enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn enable_interrupts() {}

/// Disable interrupts on the current CPU.
#[cfg(target_os = "none")]
#[inline]
pub fn disable_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn disable_interrupts() {}

/// Check if interrupts are enabled on the current CPU.
#[cfg(target_os = "none")]
#[inline]
pub fn interrupts_enabled() -> bool {
    let rflags: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nomem)) }
    rflags & 0x200 != 0
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn interrupts_enabled() -> bool {
    true
}

/// Save the current interrupt state and disable interrupts. The returned
/// value is opaque and must be passed to [`restore_interrupt_state`].
#[cfg(target_os = "none")]
#[inline]
pub fn save_and_disable_interrupts() -> u64 {
    let flags: u64;
    unsafe {
        core::arch::asm!("pushfq; pop {}; cli", out(reg) flags, options(nomem));
    }
    flags
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn save_and_disable_interrupts() -> u64 {
    0
}

/// Restore interrupt state saved by [`save_and_disable_interrupts`].
#[cfg(target_os = "none")]
#[inline]
pub fn restore_interrupt_state(flags: u64) {
    if flags & 0x200 != 0 {
        enable_interrupts();
    }
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn restore_interrupt_state(_flags: u64) {}

/// Halt the CPU until the next interrupt.
#[cfg(target_os = "none")]
#[inline]
pub fn halt() {
    unsafe { core::arch::asm!("hlt", options(nomem, nostack)) }
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn halt() {
    std::thread::yield_now();
}

// =============================================================================
// Interrupt priority mirror
// =============================================================================

/// Mirror the software IPL into the interrupt controller's priority
/// register so that masked-class interrupts stay pending in hardware.
#[cfg(target_os = "none")]
#[inline]
pub fn set_ipl_hw(level: u8) {
    crate::arch::x86::apic::set_task_priority(level);
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn set_ipl_hw(_level: u8) {}

/// Acknowledge the in-service interrupt at the controller.
#[cfg(target_os = "none")]
#[inline]
pub fn end_of_interrupt() {
    crate::arch::x86::apic::end_of_interrupt();
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn end_of_interrupt() {}

// =============================================================================
// One-shot hardware timer (the per-CPU comparator)
// =============================================================================

/// Arm the current CPU's one-shot comparator for `ticks` from now.
/// Overwrites any previously armed deadline.
#[cfg(target_os = "none")]
#[inline]
pub fn timer_arm(ticks: u64) {
    crate::arch::x86::apic::timer_arm(ticks);
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn timer_arm(ticks: u64) {
    crate::arch::hosted::timer_arm(ticks);
}

/// Stop the current CPU's comparator; returns the unexpired ticks
/// (0 if it was not armed or has already fired).
#[cfg(target_os = "none")]
#[inline]
pub fn timer_stop() -> u64 {
    crate::arch::x86::apic::timer_stop()
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn timer_stop() -> u64 {
    crate::arch::hosted::timer_stop()
}

/// Timer resolution: hardware ticks per microsecond.
#[cfg(target_os = "none")]
#[inline]
pub fn ticks_per_us() -> u64 {
    crate::arch::x86::apic::ticks_per_us()
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn ticks_per_us() -> u64 {
    crate::config::HOSTED_TICKS_PER_US
}

// =============================================================================
// Deferred-call dispatch trigger
// =============================================================================

/// Request that `cpu` runs its DPC queue as soon as its IPL allows.
/// On bare metal this is a self-IPI at the DPC vector; on the host the
/// request is serviced inline when possible, otherwise by the next
/// `lower_ipl` on that CPU.
#[cfg(target_os = "none")]
#[inline]
pub fn request_dpc_dispatch(cpu: usize) {
    crate::arch::x86::apic::send_ipi(cpu, crate::irq::DPC_VECTOR);
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn request_dpc_dispatch(cpu: usize) {
    crate::arch::hosted::request_dpc_dispatch(cpu);
}
