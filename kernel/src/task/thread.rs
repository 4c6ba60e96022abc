//! Thread data structure and lifecycle state.
//!
//! Each thread has a unique TID and a record in the scheduler table
//! (boxed, for pointer stability across table growth). On bare metal it
//! also owns a kernel stack and a saved context; on the hosted backend
//! the record drives an OS thread instead.

#[cfg(target_os = "none")]
use alloc::boxed::Box;
#[cfg(target_os = "none")]
use alloc::vec;

/// Thread identifier. Never reused within a boot.
pub type Tid = u32;

/// Execution state of a thread in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Eligible to be picked by the scheduler.
    Ready,
    /// Currently executing on a CPU.
    Running,
    /// Parked on a sleep list (semaphore or wait descriptor) or a timer.
    Sleeping,
    /// Finished execution; awaiting reaping.
    Terminated,
}

/// Why a sleeping thread was made runnable again. The first waker to
/// reach a prepared or sleeping thread decides; later wakers are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The event the thread slept for happened (signal, notify, grant).
    Normal,
    /// An interruptible sleep was aborted by a signal.
    Interrupted,
    /// A timed wait's deadline fired first.
    TimedOut,
}

/// A kernel thread.
pub struct Thread {
    pub tid: Tid,
    pub state: ThreadState,
    pub priority: u8,
    pub name: [u8; 32],
    pub exit_code: Option<i32>,
    /// Thread blocked in `join` on this one, to wake at exit.
    pub waiting_tid: Option<Tid>,
    pub parent_tid: Tid,
    pub is_idle: bool,

    // Two-phase sleep protocol (prepare_sleep / yield_now / wake_thread).
    /// Set between `prepare_sleep` and the wakeup; a waker that finds it
    /// set may deposit a reason even though the thread still runs.
    pub sleep_pending: bool,
    /// Whether the in-progress sleep may be aborted by a signal.
    pub interruptible: bool,
    /// Deposited by the first waker; consumed by `yield_now`.
    pub wake_reason: Option<WakeReason>,
    /// A signal arrived while the thread was not in an interruptible
    /// sleep; delivered at its next interruptible `prepare_sleep`.
    pub interrupt_pending: bool,

    // Placement.
    /// Transient pin: the next wakeups must put the thread back on this
    /// CPU (timer teardown must run on the queue's owner).
    pub pinned_cpu: Option<usize>,
    /// Home CPU for wakeups when not pinned.
    pub affinity_cpu: usize,
    pub last_cpu: usize,

    /// Entry point, consumed by the first activation.
    pub entry: Option<(fn(usize), usize)>,

    #[cfg(target_os = "none")]
    pub context: crate::arch::x86::context::CpuContext,
    #[cfg(target_os = "none")]
    pub kernel_stack: Box<[u8]>,
}

impl Thread {
    /// Create a thread record ready for admission to the scheduler.
    pub fn new(tid: Tid, entry: fn(usize), arg: usize, priority: u8, name: &str) -> Thread {
        let mut name_buf = [0u8; 32];
        let bytes = name.as_bytes();
        let len = bytes.len().min(31);
        name_buf[..len].copy_from_slice(&bytes[..len]);

        #[cfg(target_os = "none")]
        let (kernel_stack, context) = {
            // Allocate the stack straight on the heap; a by-value copy
            // through the current (small) stack would be fatal.
            let stack: Box<[u8]> =
                vec![0u8; crate::config::KERNEL_STACK_SIZE].into_boxed_slice();
            let stack_top = stack.as_ptr() as u64 + stack.len() as u64;
            let context = crate::arch::x86::context::init_context(
                stack_top,
                super::scheduler::thread_trampoline,
            );
            (stack, context)
        };

        Thread {
            tid,
            state: ThreadState::Ready,
            priority,
            name: name_buf,
            exit_code: None,
            waiting_tid: None,
            parent_tid: 0,
            is_idle: false,
            sleep_pending: false,
            interruptible: false,
            wake_reason: None,
            interrupt_pending: false,
            pinned_cpu: None,
            affinity_cpu: 0,
            last_cpu: 0,
            entry: Some((entry, arg)),
            #[cfg(target_os = "none")]
            context,
            #[cfg(target_os = "none")]
            kernel_stack,
        }
    }

    /// The thread name as a UTF-8 string slice.
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(32);
        core::str::from_utf8(&self.name[..len]).unwrap_or("???")
    }
}
