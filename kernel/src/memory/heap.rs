//! Kernel heap shim: `linked_list_allocator` as the global allocator.
//!
//! The real memory subsystem (frame allocator, address spaces, demand
//! paging) is a collaborator outside this crate; it hands the allocator
//! one mapped arena during early boot.

use linked_list_allocator::LockedHeap;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Give the allocator its arena.
///
/// # Safety
/// `start..start + size` must be mapped, writable, unused memory, and
/// this must be called exactly once, before the first allocation.
pub unsafe fn init(start: *mut u8, size: usize) {
    ALLOCATOR.lock().init(start, size);
}
