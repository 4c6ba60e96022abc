//! Kernel-thread context switch.
//!
//! Only callee-saved state crosses a voluntary switch boundary, so a
//! context is just a stack pointer: the callee-saved registers live in a
//! frame on the outgoing thread's stack. All kernel threads share the
//! kernel address space; CR3 never changes here.

use core::arch::global_asm;

/// Saved execution state of a kernel thread that is not running.
#[derive(Debug, Default)]
#[repr(C)]
pub struct CpuContext {
    /// Stack pointer to the switch frame (callee-saved regs + return rip).
    pub rsp: u64,
}

global_asm!(
    r#"
.global __onyx_context_switch
__onyx_context_switch:
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15
    mov [rdi], rsp
    mov rsp, rsi
    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp
    ret
"#
);

extern "C" {
    fn __onyx_context_switch(old_rsp: *mut u64, new_rsp: u64);
}

/// Switch from the current thread (context saved into `old`) to `new`.
///
/// # Safety
/// `new.rsp` must point at a switch frame built by a previous save or by
/// [`init_context`], on a live stack no other CPU is running on.
pub unsafe fn switch(old: &mut CpuContext, new: &CpuContext) {
    __onyx_context_switch(&mut old.rsp, new.rsp);
}

/// Build the initial switch frame for a fresh thread so that the first
/// switch to it "returns" into `entry` with a 16-byte-aligned stack.
pub fn init_context(stack_top: u64, entry: extern "C" fn() -> !) -> CpuContext {
    // Frame layout (low to high): r15 r14 r13 r12 rbx rbp rip.
    let mut rsp = stack_top & !0xF;
    rsp -= 8; // so that rsp % 16 == 8 at entry, matching the ABI after call
    unsafe {
        rsp -= 8;
        core::ptr::write(rsp as *mut u64, entry as usize as u64);
        for _ in 0..6 {
            rsp -= 8;
            core::ptr::write(rsp as *mut u64, 0);
        }
    }
    CpuContext { rsp }
}
