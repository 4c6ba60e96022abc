//! Kernel binary entry.
//!
//! The real entry path (boot assembly, long-mode setup, GDT/IDT stubs,
//! AP bring-up) lives in the boot layer outside this crate; it calls
//! `kmain` with memory mapped and interrupts still disabled. The hosted
//! build has nothing to boot; the substrate is exercised by `cargo test`.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use onyx_kernel::config::DEFAULT_PRIORITY;
    use onyx_kernel::{irq, klog, task::scheduler, time};

    /// Early heap arena until the memory subsystem takes over.
    const EARLY_HEAP_SIZE: usize = 4 * 1024 * 1024;

    #[repr(align(4096))]
    struct Arena([u8; EARLY_HEAP_SIZE]);

    static mut EARLY_HEAP: Arena = Arena([0; EARLY_HEAP_SIZE]);

    /// Scheduling quantum driven off the per-CPU timer queue.
    const QUANTUM_US: u64 = 1_000;

    #[no_mangle]
    pub extern "C" fn kmain() -> ! {
        klog::init();
        unsafe {
            let arena = core::ptr::addr_of_mut!(EARLY_HEAP);
            onyx_kernel::memory::heap::init((*arena).0.as_mut_ptr(), EARLY_HEAP_SIZE);
        }

        scheduler::init();
        irq::register(onyx_kernel::irq::CLOCK_VECTOR, clock_interrupt);

        scheduler::spawn(init_thread, 0, DEFAULT_PRIORITY, "init");
        time::timer::insert(QUANTUM_US, QUANTUM_US, quantum_fire, 0);

        onyx_kernel::arch::hal::enable_interrupts();
        loop {
            scheduler::schedule();
            onyx_kernel::arch::hal::halt();
        }
    }

    fn clock_interrupt(_vector: u8) {
        time::timer::isr();
    }

    fn quantum_fire(_: usize) {
        scheduler::schedule_tick();
    }

    fn init_thread(_: usize) {
        log::info!("init thread up");
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel proper only runs on bare metal; this build exists so
    // the workspace compiles on the host, where `cargo test` drives the
    // substrate through the hosted HAL.
    println!("onyx kernel: hosted build, run `cargo test`");
}
