//! Time: per-CPU timer queues, interval timers, and timed sleeps.

pub mod itimer;
pub mod sleep;
pub mod timer;
