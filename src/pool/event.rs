//! Per-slot event assembly record and state machine.
//!
//! An [`Event`] is the join point where fragments from all configured
//! sources converge. It tracks which L0 sources and calorimeter crates
//! have delivered, owns the fragments themselves, and carries the trigger
//! verdicts once computed. All mutation happens under the owning slot's
//! lock; this module contains no synchronization of its own.

use crate::mep::{L0Fragment, LkrFragment};

/// Assembly progress of one event slot.
///
/// `L1Processing` and `L2Processing` are transient and only ever observed
/// by the thread that delivered the completing fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    CollectingL0,
    CollectingLkr,
    L1Processing,
    WaitingForNonZsLkr,
    L2Processing,
    Complete,
}

/// Result of installing a fragment into an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Installed; the expected set is still incomplete.
    Added,
    /// Installed, and this fragment completed its expected set.
    Completed,
    /// This (event, source) pair already delivered; fragment dropped.
    Duplicate,
}

/// One event under assembly.
pub struct Event {
    state: SlotState,
    event_number: u32,
    burst_id: u32,
    l0_fragments: Vec<Option<L0Fragment>>,
    l0_received: usize,
    lkr_fragments: Vec<Option<LkrFragment>>,
    lkr_received: usize,
    non_zs_fragments: Vec<Option<LkrFragment>>,
    non_zs_received: usize,
    l1_verdict: Option<u8>,
    l2_verdict: Option<u8>,
}

impl Event {
    /// Create an empty record sized for the configured source topology.
    pub fn new(l0_expected: usize, lkr_expected: usize) -> Self {
        Self {
            state: SlotState::Empty,
            event_number: 0,
            burst_id: 0,
            l0_fragments: (0..l0_expected).map(|_| None).collect(),
            l0_received: 0,
            lkr_fragments: (0..lkr_expected).map(|_| None).collect(),
            lkr_received: 0,
            non_zs_fragments: (0..lkr_expected).map(|_| None).collect(),
            non_zs_received: 0,
            l1_verdict: None,
            l2_verdict: None,
        }
    }

    /// Claim this record for `(event_number, burst_id)`. Only valid on an
    /// Empty record.
    pub fn bind(&mut self, event_number: u32, burst_id: u32) {
        debug_assert_eq!(self.state, SlotState::Empty);
        self.event_number = event_number;
        self.burst_id = burst_id;
    }

    /// Reset to Empty, dropping every fragment (and thereby the MEP
    /// buffers they pin).
    pub fn reset(&mut self) {
        self.state = SlotState::Empty;
        self.event_number = 0;
        self.burst_id = 0;
        self.l0_fragments.iter_mut().for_each(|f| *f = None);
        self.l0_received = 0;
        self.lkr_fragments.iter_mut().for_each(|f| *f = None);
        self.lkr_received = 0;
        self.non_zs_fragments.iter_mut().for_each(|f| *f = None);
        self.non_zs_received = 0;
        self.l1_verdict = None;
        self.l2_verdict = None;
    }

    /// Install an L0 fragment at its source's dense index.
    pub fn add_l0(&mut self, index: usize, fragment: L0Fragment) -> AddOutcome {
        if self.l0_fragments[index].is_some() {
            return AddOutcome::Duplicate;
        }

        if matches!(self.state, SlotState::Empty) {
            self.state = SlotState::CollectingL0;
        } else if matches!(self.state, SlotState::CollectingLkr) && self.l1_verdict.is_none() {
            // Calorimeter data arrived first; the L0 join starts now.
            self.state = SlotState::CollectingL0;
        }

        self.l0_fragments[index] = Some(fragment);
        self.l0_received += 1;

        if self.l0_received == self.l0_fragments.len() {
            AddOutcome::Completed
        } else {
            AddOutcome::Added
        }
    }

    /// Install a calorimeter fragment at its crate's dense index. The
    /// non-zero-suppressed flag routes it to the follow-up batch.
    pub fn add_lkr(&mut self, index: usize, fragment: LkrFragment) -> AddOutcome {
        if matches!(self.state, SlotState::Empty) {
            self.state = SlotState::CollectingLkr;
        }

        let (slots, received) = if fragment.non_zero_suppressed() {
            (&mut self.non_zs_fragments, &mut self.non_zs_received)
        } else {
            (&mut self.lkr_fragments, &mut self.lkr_received)
        };

        if slots[index].is_some() {
            return AddOutcome::Duplicate;
        }

        slots[index] = Some(fragment);
        *received += 1;

        if *received == slots.len() {
            AddOutcome::Completed
        } else {
            AddOutcome::Added
        }
    }

    // -- State transitions --

    pub fn begin_l1(&mut self) {
        debug_assert_eq!(self.state, SlotState::CollectingL0);
        self.state = SlotState::L1Processing;
    }

    pub fn record_l1(&mut self, verdict: u8) {
        debug_assert!(self.l1_verdict.is_none());
        self.l1_verdict = Some(verdict);
    }

    pub fn mark_collecting_lkr(&mut self) {
        self.state = SlotState::CollectingLkr;
    }

    pub fn mark_waiting_non_zs(&mut self) {
        self.state = SlotState::WaitingForNonZsLkr;
    }

    pub fn begin_l2(&mut self) {
        debug_assert!(matches!(
            self.state,
            SlotState::CollectingLkr | SlotState::WaitingForNonZsLkr
        ));
        self.state = SlotState::L2Processing;
    }

    pub fn record_l2(&mut self, verdict: u8) {
        debug_assert!(self.l2_verdict.is_none(), "L2 fired twice for one event");
        self.l2_verdict = Some(verdict);
    }

    /// Terminal state. Fragments are dropped here so a Complete slot holds
    /// no MEP buffer references.
    pub fn mark_complete(&mut self) {
        self.state = SlotState::Complete;
        self.l0_fragments.iter_mut().for_each(|f| *f = None);
        self.lkr_fragments.iter_mut().for_each(|f| *f = None);
        self.non_zs_fragments.iter_mut().for_each(|f| *f = None);
    }

    // -- Completion predicates --

    pub fn l0_complete(&self) -> bool {
        self.l0_received == self.l0_fragments.len()
    }

    pub fn lkr_complete(&self) -> bool {
        self.lkr_received == self.lkr_fragments.len()
    }

    pub fn non_zs_complete(&self) -> bool {
        self.non_zs_received == self.non_zs_fragments.len()
    }

    /// Normal L2 entry condition: L1 passed, the slot is collecting the
    /// zero-suppressed readout, and that set is now full.
    pub fn ready_for_l2(&self) -> bool {
        self.state == SlotState::CollectingLkr && self.l1_verdict.is_some() && self.lkr_complete()
    }

    /// Follow-up L2 entry condition: L1 requested the non-zero-suppressed
    /// readout and that batch is now full.
    pub fn ready_for_non_zs_l2(&self) -> bool {
        self.state == SlotState::WaitingForNonZsLkr && self.non_zs_complete()
    }

    // -- Accessors --

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn event_number(&self) -> u32 {
        self.event_number
    }

    pub fn burst_id(&self) -> u32 {
        self.burst_id
    }

    pub fn l1_verdict(&self) -> Option<u8> {
        self.l1_verdict
    }

    pub fn l2_verdict(&self) -> Option<u8> {
        self.l2_verdict
    }

    pub fn l0_received(&self) -> usize {
        self.l0_received
    }

    pub fn lkr_received(&self) -> usize {
        self.lkr_received
    }

    pub fn non_zs_received(&self) -> usize {
        self.non_zs_received
    }

    pub fn l0_fragments(&self) -> impl Iterator<Item = &L0Fragment> {
        self.l0_fragments.iter().flatten()
    }

    pub fn lkr_fragments(&self) -> impl Iterator<Item = &LkrFragment> {
        self.lkr_fragments.iter().flatten()
    }

    pub fn non_zs_fragments(&self) -> impl Iterator<Item = &LkrFragment> {
        self.non_zs_fragments.iter().flatten()
    }

    /// Total payload bytes currently held across all fragment sets.
    pub fn payload_len(&self) -> usize {
        self.l0_fragments().map(L0Fragment::payload_len).sum::<usize>()
            + self.lkr_fragments().map(LkrFragment::payload_len).sum::<usize>()
            + self
                .non_zs_fragments()
                .map(LkrFragment::payload_len)
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mep::MepBuffer;
    use crate::mep::{l0, lkr};
    use crate::sources::SourceTable;

    fn l0_frag(source_id: u8, en: u32) -> L0Fragment {
        let mut raw = Vec::new();
        raw.push(source_id);
        raw.push(l0::VERSION);
        raw.extend_from_slice(&1u16.to_le_bytes());
        raw.extend_from_slice(&((l0::HEADER_SIZE + 8) as u16).to_le_bytes());
        raw.extend_from_slice(&[0u8; 2]);
        raw.extend_from_slice(&en.to_le_bytes());
        raw.extend_from_slice(&8u16.to_le_bytes());
        raw.push((en & 0xFF) as u8);
        raw.push(0);
        raw.extend_from_slice(b"data");

        let len = raw.len();
        let buf = MepBuffer::new(raw);
        let table = SourceTable::new(&[source_id]).expect("table");
        l0::parse(&buf, 0, len, &table)
            .expect("fragment")
            .into_fragments()
            .remove(0)
    }

    fn lkr_frag(crate_id: u8, en: u32, non_zs: bool) -> LkrFragment {
        let mut raw = Vec::new();
        raw.push(1);
        raw.push(lkr::VERSION);
        raw.extend_from_slice(&((lkr::HEADER_SIZE + lkr::FRAGMENT_HEADER_SIZE + 2) as u16).to_le_bytes());
        raw.extend_from_slice(&[0u8; 4]);
        raw.extend_from_slice(&((lkr::FRAGMENT_HEADER_SIZE + 2) as u16).to_le_bytes());
        raw.push(crate_id);
        raw.push(u8::from(non_zs));
        raw.extend_from_slice(&en.to_le_bytes());
        raw.extend_from_slice(b"zz");

        let len = raw.len();
        let buf = MepBuffer::new(raw);
        let table = SourceTable::new(&[crate_id]).expect("table");
        lkr::parse(&buf, 0, len, &table)
            .expect("fragment")
            .into_fragments()
            .remove(0)
    }

    #[test]
    fn test_l0_join_completes_on_last_source() {
        let mut event = Event::new(2, 1);
        event.bind(42, 3);

        assert_eq!(event.add_l0(0, l0_frag(4, 42)), AddOutcome::Added);
        assert_eq!(event.state(), SlotState::CollectingL0);
        assert_eq!(event.add_l0(1, l0_frag(8, 42)), AddOutcome::Completed);
        assert!(event.l0_complete());
    }

    #[test]
    fn test_duplicate_l0_source_dropped() {
        let mut event = Event::new(2, 1);
        event.bind(55, 0);

        assert_eq!(event.add_l0(0, l0_frag(4, 55)), AddOutcome::Added);
        assert_eq!(event.add_l0(0, l0_frag(4, 55)), AddOutcome::Duplicate);
        assert_eq!(event.l0_received(), 1);
    }

    #[test]
    fn test_lkr_before_l0_starts_collecting_lkr() {
        let mut event = Event::new(1, 1);
        event.bind(7, 0);

        assert_eq!(event.add_lkr(0, lkr_frag(0, 7, false)), AddOutcome::Completed);
        assert_eq!(event.state(), SlotState::CollectingLkr);

        // L2 must not be ready: L1 has not run.
        assert!(!event.ready_for_l2());

        // The first L0 fragment moves the join to the L0 phase.
        assert_eq!(event.add_l0(0, l0_frag(4, 7)), AddOutcome::Completed);
        assert_eq!(event.state(), SlotState::CollectingL0);
    }

    #[test]
    fn test_non_zs_routed_separately() {
        let mut event = Event::new(1, 2);
        event.bind(9, 0);

        assert_eq!(event.add_lkr(0, lkr_frag(0, 9, false)), AddOutcome::Added);
        assert_eq!(event.add_lkr(0, lkr_frag(0, 9, true)), AddOutcome::Added);
        assert_eq!(event.lkr_received(), 1);
        assert_eq!(event.non_zs_received(), 1);

        assert_eq!(event.add_lkr(1, lkr_frag(1, 9, true)), AddOutcome::Completed);
        assert!(event.non_zs_complete());
        assert!(!event.lkr_complete());
    }

    #[test]
    fn test_ready_for_l2_requires_l1_verdict() {
        let mut event = Event::new(1, 1);
        event.bind(11, 0);
        event.add_l0(0, l0_frag(4, 11));
        event.begin_l1();
        event.record_l1(5);
        event.mark_collecting_lkr();

        assert!(!event.ready_for_l2());
        event.add_lkr(0, lkr_frag(0, 11, false));
        assert!(event.ready_for_l2());
    }

    #[test]
    fn test_waiting_non_zs_ignores_zs_completion() {
        let mut event = Event::new(1, 1);
        event.bind(12, 0);
        event.add_l0(0, l0_frag(4, 12));
        event.begin_l1();
        event.record_l1(1);
        event.mark_waiting_non_zs();

        event.add_lkr(0, lkr_frag(0, 12, false));
        assert!(event.lkr_complete());
        assert!(!event.ready_for_l2());
        assert!(!event.ready_for_non_zs_l2());

        event.add_lkr(0, lkr_frag(0, 12, true));
        assert!(event.ready_for_non_zs_l2());
    }

    #[test]
    fn test_complete_releases_buffers() {
        let mut event = Event::new(1, 1);
        event.bind(13, 0);

        let frag = l0_frag(4, 13);
        let buf = frag.clone();
        event.add_l0(0, frag);
        drop(buf);

        event.mark_complete();
        assert_eq!(event.l0_fragments().count(), 0);
        assert_eq!(event.payload_len(), 0);
    }

    #[test]
    fn test_reset_returns_to_empty() {
        let mut event = Event::new(1, 1);
        event.bind(14, 2);
        event.add_l0(0, l0_frag(4, 14));
        event.reset();

        assert_eq!(event.state(), SlotState::Empty);
        assert_eq!(event.l0_received(), 0);
        assert_eq!(event.l1_verdict(), None);
    }
}
