//! Lock-free pipeline counters.
//!
//! One `Counters` holder is created at startup and threaded into every
//! worker; nothing here is a process-wide global, so tests instantiate
//! their own. All increments are relaxed atomic adds and readers tolerate
//! skew.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Why a frame, MEP, fragment or event was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DropReason {
    /// Frame shorter than its declared IP/UDP lengths, or truncated headers.
    MalformedFrame = 0,
    /// Ethernet type or IP protocol this node does not handle.
    UnhandledProtocol = 1,
    /// IPv4 destination is another host.
    ForeignDestination = 2,
    /// UDP destination port outside the configured set.
    UnknownPort = 3,
    /// MEP failed validation (bad framing, unknown source or crate ID).
    MalformedMep = 4,
    /// EOB datagram with the wrong payload size.
    MalformedEob = 5,
    /// Fragment's event number collided with a different slot occupant.
    EventNumberCollision = 6,
    /// A (slot, source) pair delivered twice.
    DuplicateFragment = 7,
    /// Trigger function panicked; event rejected.
    TriggerFailure = 8,
    /// Storage sink returned an error; event lost.
    StorageFailure = 9,
    /// Partial IP datagram evicted before completion.
    ReassemblyEvicted = 10,
}

/// Number of [`DropReason`] variants, for array sizing.
pub const DROP_REASON_COUNT: usize = 11;

impl DropReason {
    /// Canonical log label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedFrame => "malformed_frame",
            Self::UnhandledProtocol => "unhandled_protocol",
            Self::ForeignDestination => "foreign_destination",
            Self::UnknownPort => "unknown_port",
            Self::MalformedMep => "malformed_mep",
            Self::MalformedEob => "malformed_eob",
            Self::EventNumberCollision => "event_number_collision",
            Self::DuplicateFragment => "duplicate_fragment",
            Self::TriggerFailure => "trigger_failure",
            Self::StorageFailure => "storage_failure",
            Self::ReassemblyEvicted => "reassembly_evicted",
        }
    }

    /// All variants in numeric order.
    pub fn all() -> &'static [Self] {
        &[
            Self::MalformedFrame,
            Self::UnhandledProtocol,
            Self::ForeignDestination,
            Self::UnknownPort,
            Self::MalformedMep,
            Self::MalformedEob,
            Self::EventNumberCollision,
            Self::DuplicateFragment,
            Self::TriggerFailure,
            Self::StorageFailure,
            Self::ReassemblyEvicted,
        ]
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-source and per-verdict tallies for one node.
pub struct Counters {
    meps_by_source: [AtomicU64; 256],
    events_by_source: [AtomicU64; 256],
    bytes_by_source: [AtomicU64; 256],
    l1_triggers: [AtomicU64; 256],
    l2_triggers: [AtomicU64; 256],
    drops: [AtomicU64; DROP_REASON_COUNT],
    events_to_storage: AtomicU64,
    bytes_to_storage: AtomicU64,
    frames_received: AtomicU64,
    burst_advances: AtomicU64,
}

impl Counters {
    /// Create a new zeroed holder.
    pub fn new() -> Self {
        Self {
            meps_by_source: std::array::from_fn(|_| AtomicU64::new(0)),
            events_by_source: std::array::from_fn(|_| AtomicU64::new(0)),
            bytes_by_source: std::array::from_fn(|_| AtomicU64::new(0)),
            l1_triggers: std::array::from_fn(|_| AtomicU64::new(0)),
            l2_triggers: std::array::from_fn(|_| AtomicU64::new(0)),
            drops: std::array::from_fn(|_| AtomicU64::new(0)),
            events_to_storage: AtomicU64::new(0),
            bytes_to_storage: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            burst_advances: AtomicU64::new(0),
        }
    }

    /// Account one received MEP: the packet itself, the events it carries,
    /// and the captured frame bytes.
    pub fn record_mep(&self, source_id: u8, event_count: u64, frame_bytes: u64) {
        self.meps_by_source[source_id as usize].fetch_add(1, Ordering::Relaxed);
        self.events_by_source[source_id as usize].fetch_add(event_count, Ordering::Relaxed);
        self.bytes_by_source[source_id as usize].fetch_add(frame_bytes, Ordering::Relaxed);
    }

    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.drops[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l1(&self, verdict: u8) {
        self.l1_triggers[verdict as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2(&self, verdict: u8) {
        self.l2_triggers[verdict as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_send(&self, bytes: u64) {
        self.events_to_storage.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_storage.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_burst_advance(&self) {
        self.burst_advances.fetch_add(1, Ordering::Relaxed);
    }

    // -- Readers (relaxed; values may lag concurrent writers) --

    pub fn meps_received(&self, source_id: u8) -> u64 {
        self.meps_by_source[source_id as usize].load(Ordering::Relaxed)
    }

    pub fn events_received(&self, source_id: u8) -> u64 {
        self.events_by_source[source_id as usize].load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self, source_id: u8) -> u64 {
        self.bytes_by_source[source_id as usize].load(Ordering::Relaxed)
    }

    pub fn l1_trigger(&self, verdict: u8) -> u64 {
        self.l1_triggers[verdict as usize].load(Ordering::Relaxed)
    }

    pub fn l2_trigger(&self, verdict: u8) -> u64 {
        self.l2_triggers[verdict as usize].load(Ordering::Relaxed)
    }

    pub fn drop_count(&self, reason: DropReason) -> u64 {
        self.drops[reason as usize].load(Ordering::Relaxed)
    }

    pub fn events_to_storage(&self) -> u64 {
        self.events_to_storage.load(Ordering::Relaxed)
    }

    pub fn bytes_to_storage(&self) -> u64 {
        self.bytes_to_storage.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn burst_advances(&self) -> u64 {
        self.burst_advances.load(Ordering::Relaxed)
    }

    /// Non-zero drop tallies, for the periodic stats report.
    pub fn drop_snapshot(&self) -> Vec<(DropReason, u64)> {
        DropReason::all()
            .iter()
            .filter_map(|&r| {
                let v = self.drop_count(r);
                (v > 0).then_some((r, v))
            })
            .collect()
    }

    /// Total L1 verdicts recorded, all bytes.
    pub fn l1_total(&self) -> u64 {
        self.l1_triggers
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Total L2 verdicts recorded, all bytes.
    pub fn l2_total(&self) -> u64 {
        self.l2_triggers
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_mep_accumulates() {
        let c = Counters::new();
        c.record_mep(0x04, 10, 1500);
        c.record_mep(0x04, 5, 700);

        assert_eq!(c.meps_received(0x04), 2);
        assert_eq!(c.events_received(0x04), 15);
        assert_eq!(c.bytes_received(0x04), 2200);
        assert_eq!(c.meps_received(0x05), 0);
    }

    #[test]
    fn test_verdict_counters() {
        let c = Counters::new();
        c.record_l1(0);
        c.record_l1(5);
        c.record_l1(5);
        c.record_l2(9);

        assert_eq!(c.l1_trigger(0), 1);
        assert_eq!(c.l1_trigger(5), 2);
        assert_eq!(c.l1_total(), 3);
        assert_eq!(c.l2_trigger(9), 1);
        assert_eq!(c.l2_total(), 1);
    }

    #[test]
    fn test_drop_snapshot_skips_zero() {
        let c = Counters::new();
        c.record_drop(DropReason::UnknownPort);
        c.record_drop(DropReason::UnknownPort);
        c.record_drop(DropReason::DuplicateFragment);

        let snap = c.drop_snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap.contains(&(DropReason::UnknownPort, 2)));
        assert!(snap.contains(&(DropReason::DuplicateFragment, 1)));
    }

    #[test]
    fn test_storage_accounting() {
        let c = Counters::new();
        c.record_storage_send(4096);
        c.record_storage_send(1024);

        assert_eq!(c.events_to_storage(), 2);
        assert_eq!(c.bytes_to_storage(), 5120);
    }
}
