//! x86-64 bare-metal backend: port I/O, local APIC, SMP identity,
//! serial console, and the kernel-thread context switch.

pub mod apic;
pub mod context;
pub mod port;
pub mod serial;
pub mod smp;
