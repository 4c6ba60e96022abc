//! Kernel error type shared by every fallible path in the core.
//!
//! Timeouts on timed waits are reported through `WaitOutcome`, not through
//! this enum, except where a `Result` API is the natural shape (semaphores,
//! futexes). Invariant violations do not get an error variant at all; they
//! panic, because continuing would corrupt per-CPU state.

use core::fmt;

/// Result alias used throughout the kernel.
pub type Result<T> = core::result::Result<T, KernelError>;

/// Error taxonomy of the concurrency core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// A fixed-capacity slab (descriptors, DPCs, pipes, ...) is full.
    Exhausted,
    /// An interruptible wait was aborted by a signal.
    Interrupted,
    /// A timed wait elapsed with nothing to show for it.
    TimedOut,
    /// A non-blocking attempt found the resource unavailable.
    WouldBlock,
    /// The referenced object does not exist (stale id).
    NotFound,
    /// Malformed argument (bad slot index, conflicting subscription).
    InvalidArgument,
    /// The peer side of a pipe is gone.
    BrokenPipe,
}

impl KernelError {
    /// POSIX errno equivalent, for the syscall translation layer.
    pub fn errno(self) -> i32 {
        match self {
            KernelError::Exhausted => 12,       // ENOMEM
            KernelError::Interrupted => 4,      // EINTR
            KernelError::TimedOut => 110,       // ETIMEDOUT
            KernelError::WouldBlock => 11,      // EAGAIN
            KernelError::NotFound => 2,         // ENOENT
            KernelError::InvalidArgument => 22, // EINVAL
            KernelError::BrokenPipe => 32,      // EPIPE
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelError::Exhausted => "resource slab exhausted",
            KernelError::Interrupted => "wait interrupted by signal",
            KernelError::TimedOut => "timed wait elapsed",
            KernelError::WouldBlock => "operation would block",
            KernelError::NotFound => "no such object",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::BrokenPipe => "peer closed",
        };
        f.write_str(s)
    }
}
