//! Fixed-capacity event pool addressed by event number.
//!
//! Slot index is `event_number mod capacity`. The pool never evicts: a
//! fragment whose slot is occupied by a different event number is dropped
//! by the caller. Event numbers arrive dense and in-order within a burst,
//! so a capacity larger than the in-flight window makes steady-state
//! collisions impossible.
//!
//! Concurrency: the occupant field is inspected lock-free; all slot
//! mutation is serialized by a per-slot mutex. There is no global pool
//! lock and no cross-slot lock.

pub mod event;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

pub use event::{AddOutcome, Event, SlotState};

/// Occupant sentinel for an empty slot.
const UNUSED: u64 = u64::MAX;

struct Slot {
    /// Event number of the current occupant, or [`UNUSED`].
    occupant: AtomicU64,
    inner: Mutex<Event>,
}

/// Preallocated slot array; the join point of the whole pipeline.
pub struct EventPool {
    slots: Box<[Slot]>,
}

/// Pinned handle to one slot, holding its lock. Mutate the event through
/// it, then either drop it (slot stays bound) or call [`SlotGuard::release`].
pub struct SlotGuard<'a> {
    slot: &'a Slot,
    inner: MutexGuard<'a, Event>,
}

impl<'a> SlotGuard<'a> {
    pub fn event(&self) -> &Event {
        &self.inner
    }

    pub fn event_mut(&mut self) -> &mut Event {
        &mut self.inner
    }

    /// Reset the event to Empty and publish the slot as unused. The
    /// occupant store is last so a concurrent fast-path inspection never
    /// sees an unused slot with stale contents behind it.
    pub fn release(mut self) {
        self.inner.reset();
        self.slot.occupant.store(UNUSED, Ordering::Release);
    }
}

impl EventPool {
    /// Allocate `capacity` slots sized for the given source topology.
    pub fn new(capacity: usize, l0_expected: usize, lkr_expected: usize) -> Self {
        assert!(capacity > 0, "pool capacity must be positive");

        let slots = (0..capacity)
            .map(|_| Slot {
                occupant: AtomicU64::new(UNUSED),
                inner: Mutex::new(Event::new(l0_expected, lkr_expected)),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Pin the slot for `event_number`, claiming it if empty.
    ///
    /// Returns `None` when the slot is occupied by a different event
    /// number, or by the same event number from a different burst (a stale
    /// occupant the new burst's fragment must not join).
    pub fn acquire_or_bind(&self, event_number: u32, burst_id: u32) -> Option<SlotGuard<'_>> {
        let slot = &self.slots[event_number as usize % self.slots.len()];

        // Lock-free rejection of the common collision case.
        let occupant = slot.occupant.load(Ordering::Acquire);
        if occupant != UNUSED && occupant != u64::from(event_number) {
            return None;
        }

        let inner = slot.inner.lock();

        // Re-check under the lock; the slot may have changed hands.
        match slot.occupant.load(Ordering::Relaxed) {
            UNUSED => {
                let mut guard = SlotGuard { slot, inner };
                guard.event_mut().bind(event_number, burst_id);
                slot.occupant
                    .store(u64::from(event_number), Ordering::Release);
                Some(guard)
            }
            occ if occ == u64::from(event_number) => {
                if inner.burst_id() != burst_id {
                    return None;
                }
                Some(SlotGuard { slot, inner })
            }
            _ => None,
        }
    }

    /// Lock-free occupant inspection, mainly for tests and reporting.
    pub fn occupant(&self, event_number: u32) -> Option<u32> {
        let slot = &self.slots[event_number as usize % self.slots.len()];
        match slot.occupant.load(Ordering::Acquire) {
            UNUSED => None,
            occ => Some(occ as u32),
        }
    }
}
