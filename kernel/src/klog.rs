//! Kernel logger behind the `log` facade.
//!
//! On bare metal records go to the spinlocked COM1 writer; on the host
//! they go to stderr so `cargo test` output stays readable. Each record is
//! written under one lock acquisition, so lines from different CPUs never
//! interleave mid-record.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Once;

struct KernelLog;

static LOGGER: KernelLog = KernelLog;
static INIT: Once<()> = Once::new();

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        #[cfg(target_os = "none")]
        crate::arch::x86::serial::write_fmt(format_args!(
            "[{:5}] {}\n",
            record.level(),
            record.args()
        ));
        #[cfg(not(target_os = "none"))]
        eprintln!("[{:5}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Idempotent; later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        // set_logger only fails if a logger is already installed, which
        // can happen in the hosted test harness. Harmless either way.
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(if cfg!(feature = "debug_verbose") {
            LevelFilter::Trace
        } else {
            LevelFilter::Info
        });
    });
}
