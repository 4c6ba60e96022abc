//! Kernel panic: an invariant the rest of the system depends on is
//! broken, so stop every CPU rather than run on corrupted state.

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    crate::arch::hal::disable_interrupts();
    crate::arch::x86::serial::write_fmt(format_args!("\nKERNEL PANIC: {}\n", info));

    // Pull the other CPUs down with us; their halt vector is registered
    // during boot.
    let me = crate::arch::hal::cpu_id();
    for cpu in 0..crate::arch::hal::cpu_count() {
        if cpu != me {
            crate::arch::x86::apic::send_ipi(cpu, crate::irq::HALT_VECTOR);
        }
    }

    loop {
        crate::arch::hal::halt();
    }
}
