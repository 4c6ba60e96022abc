//! onyx kernel: concurrency and synchronization core.
//!
//! Everything that can block, defer, or race lives here: spinlocks, the
//! interrupt priority ceiling, deferred procedure calls, per-CPU timer
//! queues, interval timers, sleeping semaphores/mutexes, the scheduler
//! primitives, and the multiplexed wait/notify protocol that pipes,
//! futexes and device drivers are built on.
//!
//! The crate builds for bare metal (`target_os = "none"`, no_std) and for
//! the host, where `arch/hosted.rs` backs the HAL with OS threads so the
//! whole substrate runs under `cargo test`.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod cpu;
pub mod error;
pub mod ipc;
pub mod irq;
pub mod klog;
#[cfg(target_os = "none")]
pub mod memory;
#[cfg(target_os = "none")]
mod panic;
pub mod poll;
pub mod sync;
pub mod task;
pub mod time;
