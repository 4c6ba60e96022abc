//! Synchronization primitives: spinlocks for bounded critical sections,
//! semaphores and mutexes for anything that may sleep.

pub mod mutex;
pub mod semaphore;
pub mod spinlock;
