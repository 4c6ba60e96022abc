//! Memory management lives outside this crate; the kernel core only
//! needs a heap to exist.

pub mod heap;
