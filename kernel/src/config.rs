//! Compile-time tunables for the concurrency core.

/// Maximum number of CPUs supported by the kernel.
pub const MAX_CPUS: usize = 16;

/// Size of each thread's kernel-mode stack.
pub const KERNEL_STACK_SIZE: usize = 64 * 1024;

/// Number of discrete scheduling priority levels (0 = idle, 63 = highest).
pub const NUM_PRIORITIES: usize = 64;

/// Default priority for threads that do not ask for one.
pub const DEFAULT_PRIORITY: u8 = 32;

/// Capacity of the wait-descriptor slab. One slot is held per thread per
/// in-flight multiplexed wait, so this bounds concurrent blocked waits.
pub const MAX_WAIT_DESCRIPTORS: usize = 128;

/// Capacity of the deferred-call slab.
pub const MAX_DPCS: usize = 256;

/// Capacity of the interval-timer slab.
pub const MAX_ITIMERS: usize = 64;

/// Maximum number of concurrent anonymous pipes system-wide.
pub const MAX_PIPES: usize = 64;

/// Pipe buffer capacity in bytes.
pub const PIPE_BUF_SIZE: usize = 4096;

/// Hardware timer resolution used by the hosted backend (ticks per
/// microsecond). The bare-metal backend calibrates this at boot instead.
pub const HOSTED_TICKS_PER_US: u64 = 10;
