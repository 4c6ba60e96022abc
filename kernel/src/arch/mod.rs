//! Architecture backends behind the platform-agnostic HAL in [`hal`].

pub mod hal;

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub mod x86;

#[cfg(not(target_os = "none"))]
pub mod hosted;
