//! Multiplexed wait/notify: the shared blocking protocol of the kernel.
//!
//! Every waitable object embeds a [`WaitHeader`]; a waiting thread owns a
//! [`WaitDescriptor`] whose link slots subscribe to one header each. The
//! producer side ([`WaitHeader::notify`]) detaches the subscriber list,
//! delivers to every descriptor it can claim, and reinserts the rest.
//!
//! Delivery is arbitrated by one spinlock per descriptor slot guarding an
//! Idle -> Armed -> Delivered state machine. Whoever claims the
//! descriptor (a notify or the timeout DPC) performs the scheduler wakeup
//! while still holding that lock, so the claim and the wakeup are atomic:
//! this closes the race between an event firing and the thread actually
//! descheduling, and it is what guarantees at most one delivered event
//! per wait cycle. Events that match a subscriber but lose the claim are
//! latched in the header's pending mask and consumed by the next `watch`
//! or `wait` that cares.
//!
//! Descriptors live in a fixed generation-stamped slab; headers hold only
//! `(slot, generation, link)` back-references, so a stale reference can
//! never touch recycled descriptor memory.

pub mod event;

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::arch::hal;
use crate::config::MAX_WAIT_DESCRIPTORS;
use crate::error::{KernelError, Result};
use crate::irq::dpc::{self, DeferredCall, DpcToken};
use crate::sync::spinlock::{Spinlock, SpinlockGuard};
use crate::task::scheduler::{self, WakeReason};
use crate::task::thread::Tid;
use crate::time::timer::{self, TimerId};

bitflags! {
    /// Event classes carried between notifiers and subscribers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        /// Data (or space, or a connection) is available to consume.
        const READABLE = 1 << 0;
        /// The object can accept more data.
        const WRITABLE = 1 << 1;
        /// The object is in an error state.
        const ERROR    = 1 << 2;
        /// The peer side is gone.
        const HANGUP   = 1 << 3;
    }
}

/// Error and hang-up are delivered whether or not they were asked for.
const ALWAYS_DELIVERED: PollEvents = PollEvents::ERROR.union(PollEvents::HANGUP);

/// Result of one wait cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Exactly one subscribed event was delivered.
    Event { slot: usize, events: PollEvents },
    /// The timeout elapsed with no event.
    TimedOut,
    /// The wait was aborted by a signal.
    Interrupted,
}

// =============================================================================
// WaitHeader
// =============================================================================

/// Non-owning reference from a header to one descriptor link.
#[derive(Debug, Clone, Copy)]
struct Subscriber {
    desc: u32,
    generation: u32,
    slot: usize,
    requested: PollEvents,
}

struct HeaderInner {
    subscribers: Vec<Subscriber>,
    /// Events that matched a subscriber but lost the at-most-one race,
    /// kept for the next interested wait cycle.
    pending: PollEvents,
}

/// The wait list embedded in every waitable object. Must outlive every
/// subscription; the `leave`-before-destroy discipline guarantees it.
pub struct WaitHeader {
    inner: Spinlock<HeaderInner>,
}

impl WaitHeader {
    pub const fn new() -> WaitHeader {
        WaitHeader {
            inner: Spinlock::new(HeaderInner {
                subscribers: Vec::new(),
                pending: PollEvents::empty(),
            }),
        }
    }

    /// Producer side: deliver `events` to current subscribers.
    ///
    /// The subscriber list is detached first, so subscriptions arriving
    /// during the scan land in the emptied header and see only later
    /// notifies. Each matching subscriber is claimed under its
    /// descriptor lock; winners are woken there and then, losers leave
    /// their event bits latched in this header.
    pub fn notify(&self, events: PollEvents) {
        if events.is_empty() {
            return;
        }
        let scan = {
            let mut h = self.inner.lock();
            core::mem::take(&mut h.subscribers)
        };

        let mut keep: Vec<Subscriber> = Vec::with_capacity(scan.len());
        let mut latch = PollEvents::empty();
        for sub in scan {
            let deliver = (sub.requested | ALWAYS_DELIVERED) & events;
            if deliver.is_empty() {
                keep.push(sub);
                continue;
            }
            match claim_descriptor(sub, deliver) {
                Claim::Delivered => keep.push(sub),
                Claim::Lost => {
                    latch |= deliver;
                    keep.push(sub);
                }
                Claim::Stale => {}
            }
        }

        let mut h = self.inner.lock();
        h.pending |= latch;
        h.subscribers.extend(keep);
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    #[cfg(test)]
    pub(crate) fn pending_events(&self) -> PollEvents {
        self.inner.lock().pending
    }
}

impl Default for WaitHeader {
    fn default() -> Self {
        WaitHeader::new()
    }
}

// =============================================================================
// Descriptor slab
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Not waiting; a claim parks the event for the next wait.
    Idle,
    /// The owner is committed to sleeping; a claim must wake it.
    Armed,
    /// This cycle's delivery happened (event or timeout).
    Delivered,
}

/// One edge from this descriptor to a header; `header == 0` is unused.
/// The address is kept as an integer because it is a non-owning
/// reference resolved only under the protocol's lifetime contract.
#[derive(Clone, Copy)]
struct LinkState {
    header: usize,
    requested: PollEvents,
}

struct DescCore {
    owner: Tid,
    phase: Phase,
    delivered: Option<(usize, PollEvents)>,
    links: Vec<LinkState>,
    timeout_timer: Option<TimerId>,
    timeout_dpc: DeferredCall,
}

struct DescSlot {
    /// Bumped on allocate, leave, and free: any subscriber carrying an
    /// older generation is dead weight to be dropped on sight.
    generation: u32,
    core: Option<DescCore>,
}

static DESCRIPTORS: [Spinlock<DescSlot>; MAX_WAIT_DESCRIPTORS] =
    [const { Spinlock::new(DescSlot { generation: 0, core: None }) }; MAX_WAIT_DESCRIPTORS];

enum Claim {
    Delivered,
    Lost,
    Stale,
}

/// Try to make `deliver` this descriptor's one event for the current
/// cycle. The wakeup of an armed owner happens while the descriptor
/// lock is held (the hand-off invariant).
fn claim_descriptor(sub: Subscriber, deliver: PollEvents) -> Claim {
    let mut g = DESCRIPTORS[sub.desc as usize].lock();
    if g.generation != sub.generation {
        return Claim::Stale;
    }
    let core = match g.core.as_mut() {
        Some(c) => c,
        None => return Claim::Stale,
    };
    if core.delivered.is_some() || core.phase == Phase::Delivered {
        return Claim::Lost;
    }
    core.delivered = Some((sub.slot, deliver));
    if core.phase == Phase::Armed {
        core.phase = Phase::Delivered;
        scheduler::wake_thread(core.owner, WakeReason::Normal);
    }
    Claim::Delivered
}

/// Pack a descriptor reference into the 32-bit payload of a DPC token.
fn pack_ref(slot: u32, generation: u32) -> u32 {
    (slot << 24) | (generation & 0x00FF_FFFF)
}

fn unpack_ref(raw: u32) -> (usize, u32) {
    ((raw >> 24) as usize, raw & 0x00FF_FFFF)
}

/// Timer callback of a timed wait: push the claim down to DPC level.
fn poll_timeout_fire(arg: usize) {
    let (token, _) = DpcToken::unpack(arg);
    dpc::enqueue_token(token, poll_timeout_body, arg);
}

/// Timeout DPC: claim the descriptor; if an event got there first the
/// claim fails and the timeout dissolves.
fn poll_timeout_body(arg: usize) {
    let (_, payload) = DpcToken::unpack(arg);
    let (slot, generation) = unpack_ref(payload);
    let mut g = DESCRIPTORS[slot].lock();
    if g.generation & 0x00FF_FFFF != generation {
        return;
    }
    let core = match g.core.as_mut() {
        Some(c) => c,
        None => return,
    };
    if core.phase != Phase::Armed {
        return;
    }
    core.phase = Phase::Delivered;
    scheduler::wake_thread(core.owner, WakeReason::TimedOut);
}

// =============================================================================
// WaitDescriptor
// =============================================================================

/// A thread's wait context: N link slots, each subscribable to one
/// header. Owned by the waiting thread; reusable across wait cycles;
/// must `leave` its headers before being dropped.
pub struct WaitDescriptor {
    slot: u32,
    generation: u32,
}

impl WaitDescriptor {
    /// Allocate a descriptor with `links` subscription slots. Fails only
    /// on slab exhaustion.
    pub fn new(links: usize) -> Result<WaitDescriptor> {
        let owner = scheduler::current_tid();
        for (i, slot) in DESCRIPTORS.iter().enumerate() {
            let mut g = slot.lock();
            if g.core.is_some() {
                continue;
            }
            let timeout_dpc = DeferredCall::new()?;
            g.generation = g.generation.wrapping_add(1);
            g.core = Some(DescCore {
                owner,
                phase: Phase::Idle,
                delivered: None,
                links: alloc::vec![
                    LinkState { header: 0, requested: PollEvents::empty() };
                    links
                ],
                timeout_timer: None,
                timeout_dpc,
            });
            return Ok(WaitDescriptor { slot: i as u32, generation: g.generation });
        }
        Err(KernelError::Exhausted)
    }

    fn lock_slot(&self) -> SpinlockGuard<'static, DescSlot> {
        let g = DESCRIPTORS[self.slot as usize].lock();
        assert_eq!(g.generation, self.generation, "stale wait descriptor handle");
        g
    }

    /// Subscribe link `slot` to `header` with interest `events`.
    /// Idempotent per link; re-watching the same header updates the
    /// mask. Latched pending events that match are consumed and become
    /// this descriptor's delivered event immediately.
    pub fn watch(&mut self, slot: usize, header: &WaitHeader, events: PollEvents) -> Result<()> {
        let header_addr = header as *const WaitHeader as usize;
        {
            let mut g = self.lock_slot();
            let core = g.core.as_mut().expect("descriptor freed under a live handle");
            let link = core.links.get_mut(slot).ok_or(KernelError::InvalidArgument)?;
            if link.header != 0 && link.header != header_addr {
                return Err(KernelError::InvalidArgument);
            }
            link.header = header_addr;
            link.requested = events;
        }

        let deliverable = {
            let mut h = header.inner.lock();
            let existing = h
                .subscribers
                .iter()
                .position(|s| s.desc == self.slot && s.generation == self.generation && s.slot == slot);
            match existing {
                Some(i) => h.subscribers[i].requested = events,
                None => h.subscribers.push(Subscriber {
                    desc: self.slot,
                    generation: self.generation,
                    slot,
                    requested: events,
                }),
            }
            let hit = h.pending & (events | ALWAYS_DELIVERED);
            h.pending &= !hit;
            hit
        };

        if !deliverable.is_empty() {
            let claimed = {
                let mut g = self.lock_slot();
                let core = g.core.as_mut().expect("descriptor freed under a live handle");
                if core.delivered.is_none() {
                    core.delivered = Some((slot, deliverable));
                    true
                } else {
                    false
                }
            };
            if !claimed {
                // Another header delivered in between; put the bits back.
                let mut h = header.inner.lock();
                h.pending |= deliverable;
            }
        }
        Ok(())
    }

    /// The suspension point. Returns the one delivered event, or
    /// `TimedOut` after `timeout_us` microseconds (`0` = wait forever),
    /// or `Interrupted` if a signal aborted the sleep.
    pub fn wait(&mut self, timeout_us: u64) -> WaitOutcome {
        // Arm phase: one descriptor-lock critical section covering the
        // already-delivered check, the latched-event sweep, the sleep
        // preparation, and the timeout arming. A notify that runs after
        // we drop this lock finds us Armed (or prepared) and cannot be
        // lost.
        {
            let mut g = self.lock_slot();
            let core = g.core.as_mut().expect("descriptor freed under a live handle");
            if let Some((slot, events)) = core.delivered.take() {
                core.phase = Phase::Idle;
                return WaitOutcome::Event { slot, events };
            }
            for i in 0..core.links.len() {
                let LinkState { header, requested } = core.links[i];
                if header == 0 {
                    continue;
                }
                // SAFETY: subscribed headers outlive the subscription.
                let header = unsafe { &*(header as *const WaitHeader) };
                let mut h = header.inner.lock();
                let hit = h.pending & (requested | ALWAYS_DELIVERED);
                if !hit.is_empty() {
                    h.pending &= !hit;
                    core.phase = Phase::Idle;
                    return WaitOutcome::Event { slot: i, events: hit };
                }
            }
            core.phase = Phase::Armed;
            scheduler::prepare_sleep(true);
            if timeout_us != 0 {
                // Pin so the timer teardown below runs on the CPU whose
                // queue holds the entry.
                scheduler::pin_to_cpu(hal::cpu_id());
                let arg = core
                    .timeout_dpc
                    .token()
                    .pack(pack_ref(self.slot, self.generation));
                core.timeout_timer = Some(timer::insert(timeout_us, 0, poll_timeout_fire, arg));
            }
        }

        let reason = scheduler::yield_now();

        let mut relatch: Option<(usize, PollEvents)> = None;
        let outcome = {
            let mut g = self.lock_slot();
            let core = g.core.as_mut().expect("descriptor freed under a live handle");
            if let Some(id) = core.timeout_timer.take() {
                timer::cancel(id);
                // Retire rather than dequeue: a fire caught between the
                // comparator and the DPC queue holds a now-stale token.
                dpc::retire(&mut core.timeout_dpc);
            }
            match reason {
                WakeReason::Normal => {
                    let (slot, events) = core
                        .delivered
                        .take()
                        .expect("woken normally with no delivered event");
                    core.phase = Phase::Idle;
                    WaitOutcome::Event { slot, events }
                }
                WakeReason::TimedOut => {
                    debug_assert!(core.delivered.is_none());
                    core.phase = Phase::Idle;
                    WaitOutcome::TimedOut
                }
                WakeReason::Interrupted => {
                    // A delivery may have claimed us just before the
                    // interrupt won the reason cell; put the event back
                    // in its header rather than eating it.
                    if let Some((slot, events)) = core.delivered.take() {
                        relatch = Some((core.links[slot].header, events));
                    }
                    core.phase = Phase::Idle;
                    WaitOutcome::Interrupted
                }
            }
        };
        if let Some((addr, events)) = relatch {
            if addr != 0 {
                // SAFETY: subscribed headers outlive the subscription.
                let header = unsafe { &*(addr as *const WaitHeader) };
                header.inner.lock().pending |= events;
            }
        }
        if timeout_us != 0 {
            scheduler::clear_pin();
        }
        outcome
    }

    /// Detach every link from whatever header it is subscribed to.
    ///
    /// Must run once per completed wait cycle before the descriptor is
    /// dropped or reused; idempotent. The generation bump makes any
    /// subscriber copy still riding a concurrent notify scan stale.
    pub fn leave(&mut self) {
        let old_generation = self.generation;
        let link_count = {
            let mut g = self.lock_slot();
            g.generation = g.generation.wrapping_add(1);
            self.generation = g.generation;
            let core = g.core.as_mut().expect("descriptor freed under a live handle");
            core.phase = Phase::Idle;
            core.delivered = None;
            core.links.len()
        };
        for i in 0..link_count {
            let addr = {
                let mut g = self.lock_slot();
                let core = g.core.as_mut().expect("descriptor freed under a live handle");
                let addr = core.links[i].header;
                core.links[i].header = 0;
                core.links[i].requested = PollEvents::empty();
                addr
            };
            if addr == 0 {
                continue;
            }
            // SAFETY: subscribed headers outlive the subscription.
            let header = unsafe { &*(addr as *const WaitHeader) };
            let mut h = header.inner.lock();
            h.subscribers.retain(|s| {
                !(s.desc == self.slot && s.generation == old_generation && s.slot == i)
            });
        }
    }
}

impl Drop for WaitDescriptor {
    fn drop(&mut self) {
        let attached = {
            let g = self.lock_slot();
            g.core
                .as_ref()
                .map_or(false, |c| c.links.iter().any(|l| l.header != 0))
        };
        // Dropping with live subscriptions would leave headers pointing
        // into a recycled slot; that is a caller bug.
        assert!(!attached, "wait descriptor destroyed without leave()");
        let mut g = DESCRIPTORS[self.slot as usize].lock();
        g.generation = g.generation.wrapping_add(1);
        g.core = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::scheduler::{interrupt_thread, join, spawn};
    use std::time::{Duration, Instant};

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn idle_delivery_completes_next_wait_immediately() {
        static HDR: WaitHeader = WaitHeader::new();
        let mut d = WaitDescriptor::new(1).unwrap();
        d.watch(0, &HDR, PollEvents::READABLE).unwrap();
        HDR.notify(PollEvents::READABLE);
        assert_eq!(
            d.wait(0),
            WaitOutcome::Event { slot: 0, events: PollEvents::READABLE }
        );
        d.leave();
    }

    #[test]
    fn hangup_delivered_even_if_not_requested() {
        static HDR: WaitHeader = WaitHeader::new();
        let mut d = WaitDescriptor::new(1).unwrap();
        d.watch(0, &HDR, PollEvents::WRITABLE).unwrap();
        HDR.notify(PollEvents::HANGUP);
        assert_eq!(
            d.wait(0),
            WaitOutcome::Event { slot: 0, events: PollEvents::HANGUP }
        );
        d.leave();
    }

    #[test]
    fn unsubscribed_notify_is_not_latched() {
        static HDR: WaitHeader = WaitHeader::new();
        HDR.notify(PollEvents::READABLE);
        assert_eq!(HDR.pending_events(), PollEvents::empty());
    }

    static AMO_X: WaitHeader = WaitHeader::new();
    static AMO_Y: WaitHeader = WaitHeader::new();
    static AMO_OUTCOME: Spinlock<Option<WaitOutcome>> = Spinlock::new(None);

    fn amo_waiter(_: usize) {
        let mut d = WaitDescriptor::new(2).unwrap();
        d.watch(0, &AMO_X, PollEvents::READABLE).unwrap();
        d.watch(1, &AMO_Y, PollEvents::READABLE).unwrap();
        let outcome = d.wait(0);
        d.leave();
        *AMO_OUTCOME.lock() = Some(outcome);
    }

    #[test]
    fn at_most_one_delivery_latches_the_loser() {
        let tid = spawn(amo_waiter, 0, 40, "amo");
        wait_until(|| AMO_X.subscriber_count() == 1 && AMO_Y.subscriber_count() == 1);

        AMO_X.notify(PollEvents::READABLE);
        AMO_Y.notify(PollEvents::READABLE);
        assert_eq!(join(tid), Some(0));

        let outcome = AMO_OUTCOME.lock().expect("waiter recorded no outcome");
        let won = match outcome {
            WaitOutcome::Event { slot, events } => {
                assert_eq!(events, PollEvents::READABLE);
                slot
            }
            other => panic!("expected an event, got {:?}", other),
        };

        // The other event is still pending in its header and completes a
        // fresh descriptor's wait without a further notify.
        let loser = if won == 0 { &AMO_Y } else { &AMO_X };
        assert!(loser.pending_events().contains(PollEvents::READABLE));
        let mut d = WaitDescriptor::new(1).unwrap();
        d.watch(0, loser, PollEvents::READABLE).unwrap();
        assert_eq!(
            d.wait(0),
            WaitOutcome::Event { slot: 0, events: PollEvents::READABLE }
        );
        d.leave();
    }

    #[test]
    fn timeout_without_event_is_not_an_error() {
        static HDR: WaitHeader = WaitHeader::new();
        let mut d = WaitDescriptor::new(1).unwrap();
        d.watch(0, &HDR, PollEvents::READABLE).unwrap();
        let start = Instant::now();
        let outcome = d.wait(20_000);
        let elapsed = Instant::now() - start;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(elapsed >= Duration::from_millis(18), "woke after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(4), "woke after {:?}", elapsed);
        d.leave();
    }

    #[test]
    fn event_beats_timeout() {
        static HDR: WaitHeader = WaitHeader::new();

        fn notifier(_: usize) {
            wait_until(|| HDR.subscriber_count() == 1);
            HDR.notify(PollEvents::READABLE);
        }

        spawn(notifier, 0, 40, "notify");
        let mut d = WaitDescriptor::new(1).unwrap();
        d.watch(0, &HDR, PollEvents::READABLE).unwrap();
        assert_eq!(
            d.wait(5_000_000),
            WaitOutcome::Event { slot: 0, events: PollEvents::READABLE }
        );
        d.leave();
    }

    static INT_A: WaitHeader = WaitHeader::new();
    static INT_B: WaitHeader = WaitHeader::new();
    static INT_OUTCOME: Spinlock<Option<WaitOutcome>> = Spinlock::new(None);

    fn interrupted_waiter(_: usize) {
        let mut d = WaitDescriptor::new(2).unwrap();
        d.watch(0, &INT_A, PollEvents::READABLE).unwrap();
        d.watch(1, &INT_B, PollEvents::READABLE).unwrap();
        let outcome = d.wait(0);
        d.leave();
        // A second leave must be harmless before destruction.
        d.leave();
        *INT_OUTCOME.lock() = Some(outcome);
    }

    #[test]
    fn interruption_detaches_every_membership() {
        let tid = spawn(interrupted_waiter, 0, 40, "intpoll");
        wait_until(|| INT_A.subscriber_count() == 1 && INT_B.subscriber_count() == 1);
        interrupt_thread(tid);
        assert_eq!(join(tid), Some(0));
        assert_eq!(*INT_OUTCOME.lock(), Some(WaitOutcome::Interrupted));
        assert_eq!(INT_A.subscriber_count(), 0);
        assert_eq!(INT_B.subscriber_count(), 0);
    }

    #[test]
    fn descriptor_slots_recycle() {
        let mut held = alloc::vec::Vec::new();
        for _ in 0..8 {
            held.push(WaitDescriptor::new(1).unwrap());
        }
        held.clear();
        for _ in 0..8 {
            held.push(WaitDescriptor::new(1).unwrap());
        }
    }
}
