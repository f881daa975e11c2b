//! Burst-ID epoch manager.
//!
//! The accelerator runs in bursts delimited by an end-of-burst broadcast.
//! The burst ID must not switch at the precise EOB boundary: sibling
//! workers may still be draining frames from the finished burst. The next
//! ID is therefore staged on EOB reception and only published once an L0
//! MEP with a small event number arrives after a grace period, proving the
//! new burst has genuinely started and the old one has drained.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// First event numbers below this are taken as evidence of a fresh burst.
pub const SMALL_EVENT_THRESHOLD: u32 = 1000;

/// Exact EOB broadcast payload size: `finished_burst_id: u32 LE` plus
/// four reserved bytes. Any other UDP length on the EOB port is dropped.
pub const EOB_PAYLOAD_SIZE: usize = 8;

/// Default grace between EOB reception and burst-ID publication.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

/// Staged burst-ID advance: a pair of atomics plus a monotonic EOB
/// timestamp. Lock-free on both the EOB and the per-MEP paths.
pub struct BurstTracker {
    current: AtomicU32,
    next: AtomicU32,
    /// Nanoseconds from `base` to the last EOB reception.
    eob_at_nanos: AtomicU64,
    base: Instant,
    grace: Duration,
}

impl BurstTracker {
    pub fn new(first_burst_id: u32, grace: Duration) -> Self {
        Self {
            current: AtomicU32::new(first_burst_id),
            next: AtomicU32::new(first_burst_id),
            eob_at_nanos: AtomicU64::new(0),
            base: Instant::now(),
            grace,
        }
    }

    /// Burst ID events are currently admitted under.
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    /// Staged burst ID; equals `current` outside the EOB window.
    pub fn next(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }

    /// Record an EOB broadcast naming the burst that just finished.
    pub fn on_eob(&self, finished_burst_id: u32) {
        let nanos = self.base.elapsed().as_nanos() as u64;
        self.eob_at_nanos.store(nanos, Ordering::Release);
        self.next
            .store(finished_burst_id.wrapping_add(1), Ordering::Release);
    }

    /// Called on every L0 MEP ingress with the MEP's first event number.
    /// Publishes the staged burst ID once the evidence conditions hold;
    /// returns the new ID when an advance happened at this call.
    pub fn on_l0_mep(&self, first_event_number: u32) -> Option<u32> {
        let next = self.next.load(Ordering::Acquire);
        if next == self.current.load(Ordering::Acquire) {
            return None;
        }

        if first_event_number >= SMALL_EVENT_THRESHOLD {
            return None;
        }

        let eob_at = Duration::from_nanos(self.eob_at_nanos.load(Ordering::Acquire));
        if self.base.elapsed().saturating_sub(eob_at) <= self.grace {
            return None;
        }

        // Concurrent callers may race here; both store the same value.
        self.current.store(next, Ordering::Release);
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_advance_without_eob() {
        let tracker = BurstTracker::new(10, Duration::from_millis(10));
        assert_eq!(tracker.on_l0_mep(3), None);
        assert_eq!(tracker.current(), 10);
    }

    #[test]
    fn test_advance_after_grace_and_small_event() {
        let tracker = BurstTracker::new(10, Duration::from_millis(20));
        tracker.on_eob(10);
        assert_eq!(tracker.current(), 10);
        assert_eq!(tracker.next(), 11);

        // Inside the grace window: no advance even for a small event.
        assert_eq!(tracker.on_l0_mep(3), None);
        assert_eq!(tracker.current(), 10);

        std::thread::sleep(Duration::from_millis(40));

        // Large event numbers are still late traffic from the old burst.
        assert_eq!(tracker.on_l0_mep(50_000), None);
        assert_eq!(tracker.current(), 10);

        assert_eq!(tracker.on_l0_mep(3), Some(11));
        assert_eq!(tracker.current(), 11);

        // Idempotent once published.
        assert_eq!(tracker.on_l0_mep(4), None);
        assert_eq!(tracker.current(), 11);
    }

    #[test]
    fn test_eob_refresh_restarts_grace() {
        let tracker = BurstTracker::new(7, Duration::from_millis(30));
        tracker.on_eob(7);
        std::thread::sleep(Duration::from_millis(50));

        // A second EOB (e.g. retransmitted with a newer ID) restarts the clock.
        tracker.on_eob(8);
        assert_eq!(tracker.next(), 9);
        assert_eq!(tracker.on_l0_mep(1), None);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(tracker.on_l0_mep(1), Some(9));
    }

    #[test]
    fn test_burst_id_wraps() {
        let tracker = BurstTracker::new(u32::MAX, Duration::from_millis(0));
        tracker.on_eob(u32::MAX);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.on_l0_mep(0), Some(0));
    }
}
