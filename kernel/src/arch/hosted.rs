//! Hosted backend: the kernel's execution model mapped onto OS threads.
//!
//! CPUs become thread-local tags, blocking becomes park/unpark, and the
//! per-CPU one-shot comparator becomes a watcher thread on a monotonic
//! clock that calls the timer ISR at clock priority. This is what lets the
//! whole substrate (including the timeout-vs-event races) run unmodified
//! under `cargo test`.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{HOSTED_TICKS_PER_US, MAX_CPUS};
use crate::task::thread::Tid;

thread_local! {
    static CURRENT_CPU: Cell<Option<usize>> = const { Cell::new(None) };
    static CURRENT_TID: Cell<Option<Tid>> = const { Cell::new(None) };
}

/// Round-robin assignment of fresh execution contexts to CPUs, so
/// concurrent tests land on mostly-distinct per-CPU state.
static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

/// CPU tag of the calling context, assigned on first use.
pub fn cpu_id() -> usize {
    CURRENT_CPU.with(|c| match c.get() {
        Some(id) => id,
        None => {
            let id = NEXT_CPU.fetch_add(1, Ordering::Relaxed) % MAX_CPUS;
            c.set(Some(id));
            id
        }
    })
}

/// Retag the calling context onto `cpu`. This is what "migration" means
/// on the hosted backend.
pub fn set_cpu(cpu: usize) {
    assert!(cpu < MAX_CPUS, "cpu {} out of range", cpu);
    CURRENT_CPU.with(|c| c.set(Some(cpu)));
}

/// TID of the kernel thread bound to the calling OS thread, if any.
pub fn current_tid() -> Option<Tid> {
    CURRENT_TID.with(|c| c.get())
}

pub fn set_current_tid(tid: Tid) {
    CURRENT_TID.with(|c| c.set(Some(tid)));
}

// =============================================================================
// Parking: the hosted stand-in for the context switch
// =============================================================================

fn parking() -> &'static Mutex<HashMap<Tid, thread::Thread>> {
    static PARKING: OnceLock<Mutex<HashMap<Tid, thread::Thread>>> = OnceLock::new();
    PARKING.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Bind the calling OS thread to `tid` so `unpark(tid)` can find it.
pub fn register_parker(tid: Tid) {
    parking()
        .lock()
        .expect("parking registry poisoned")
        .insert(tid, thread::current());
}

pub fn deregister_parker(tid: Tid) {
    parking()
        .lock()
        .expect("parking registry poisoned")
        .remove(&tid);
}

/// Park the calling thread. Returns on `unpark` (or spuriously; callers
/// re-check their wake condition in a loop).
pub fn park_current() {
    thread::park();
}

/// Deliver the wake token to `tid`. A token delivered before the target
/// parks is not lost, which is exactly the semantics the scheduler's
/// two-phase sleep needs.
pub fn unpark(tid: Tid) {
    if let Some(h) = parking()
        .lock()
        .expect("parking registry poisoned")
        .get(&tid)
    {
        h.unpark();
    }
}

// =============================================================================
// One-shot comparator per CPU
// =============================================================================

struct HostTimer {
    state: Mutex<TimerState>,
    cv: Condvar,
}

struct TimerState {
    deadline: Option<Instant>,
    /// Bumped on every arm/stop so the watcher can tell a re-arm from the
    /// deadline it was sleeping towards.
    epoch: u64,
    watcher_running: bool,
}

impl HostTimer {
    const fn new() -> Self {
        HostTimer {
            state: Mutex::new(TimerState {
                deadline: None,
                epoch: 0,
                watcher_running: false,
            }),
            cv: Condvar::new(),
        }
    }
}

static TIMERS: [HostTimer; MAX_CPUS] = [const { HostTimer::new() }; MAX_CPUS];

fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_nanos(ticks.saturating_mul(1000) / HOSTED_TICKS_PER_US)
}

fn duration_to_ticks(d: Duration) -> u64 {
    (d.as_nanos() as u64).saturating_mul(HOSTED_TICKS_PER_US) / 1000
}

/// Arm the calling CPU's comparator `ticks` from now.
pub fn timer_arm(ticks: u64) {
    let cpu = cpu_id();
    let t = &TIMERS[cpu];
    let mut st = t.state.lock().expect("timer state poisoned");
    st.deadline = Some(Instant::now() + ticks_to_duration(ticks));
    st.epoch += 1;
    if !st.watcher_running {
        st.watcher_running = true;
        thread::Builder::new()
            .name(format!("timer-watcher/{}", cpu))
            .spawn(move || watcher(cpu))
            .expect("failed to spawn timer watcher");
    }
    t.cv.notify_all();
}

/// Disarm the calling CPU's comparator, returning unexpired ticks.
pub fn timer_stop() -> u64 {
    let cpu = cpu_id();
    let t = &TIMERS[cpu];
    let mut st = t.state.lock().expect("timer state poisoned");
    match st.deadline.take() {
        Some(d) => {
            st.epoch += 1;
            t.cv.notify_all();
            let now = Instant::now();
            if d > now {
                duration_to_ticks(d - now)
            } else {
                0
            }
        }
        None => 0,
    }
}

/// The watcher models the timer interrupt: it sleeps until the armed
/// deadline, then runs the timer ISR at clock priority on its CPU. The
/// IPL lower afterwards drains any DPCs the ISR queued.
fn watcher(cpu: usize) {
    set_cpu(cpu);
    let t = &TIMERS[cpu];
    loop {
        {
            let mut st = t.state.lock().expect("timer state poisoned");
            loop {
                match st.deadline {
                    None => {
                        st = t.cv.wait(st).expect("timer state poisoned");
                    }
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            st.deadline = None;
                            break;
                        }
                        let epoch = st.epoch;
                        let (g, _) = t
                            .cv
                            .wait_timeout(st, d - now)
                            .expect("timer state poisoned");
                        st = g;
                        if st.epoch != epoch {
                            // Re-armed or stopped while we slept; re-evaluate.
                            continue;
                        }
                    }
                }
            }
        }
        let old = crate::irq::ipl::raise(crate::irq::ipl::Ipl::Clock);
        crate::time::timer::isr();
        crate::irq::ipl::lower(old);
    }
}

/// Service a DPC dispatch request for `cpu`. Runs the queue inline when
/// the request is for the calling CPU and its IPL allows; otherwise the
/// next `lower_ipl` on that CPU picks the queue up.
pub fn request_dpc_dispatch(cpu: usize) {
    if cpu == cpu_id() && crate::irq::ipl::current() < crate::irq::ipl::Ipl::Dpc {
        crate::irq::dpc::dispatch_pending();
    }
}
