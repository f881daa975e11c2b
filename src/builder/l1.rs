//! L1 builder: the L0 fragment join.
//!
//! Routes each L0 fragment to its event slot and fires the L1 trigger on
//! the fragment that completes the expected source set. The verdict
//! decides whether the event dies here, waits for the normal calorimeter
//! readout, or requests the non-zero-suppressed follow-up.

use std::sync::Arc;

use crate::mep::L0Fragment;
use crate::pool::{AddOutcome, EventPool, SlotGuard};
use crate::sources::SourceTable;
use crate::stats::{Counters, DropReason};

use super::l2::L2Builder;
use super::trigger::{catch_verdict, L1Trigger, L1_REJECT, L1_REQUEST_NON_ZS};

pub struct L1Builder {
    pool: Arc<EventPool>,
    sources: Arc<SourceTable>,
    counters: Arc<Counters>,
    trigger: Arc<dyn L1Trigger>,
    l2: Arc<L2Builder>,
}

impl L1Builder {
    pub fn new(
        pool: Arc<EventPool>,
        sources: Arc<SourceTable>,
        counters: Arc<Counters>,
        trigger: Arc<dyn L1Trigger>,
        l2: Arc<L2Builder>,
    ) -> Self {
        Self {
            pool,
            sources,
            counters,
            trigger,
            l2,
        }
    }

    /// The expected L0 source set this builder joins over.
    pub fn sources(&self) -> &SourceTable {
        &self.sources
    }

    /// The downstream L2 stage.
    pub fn l2(&self) -> &L2Builder {
        &self.l2
    }

    /// Install one L0 fragment under the burst it arrived in.
    pub fn build(&self, fragment: L0Fragment, burst_id: u32) {
        // Parsing already vetted the source ID against the same table.
        let Some(index) = self.sources.index_of(fragment.source_id()) else {
            self.counters.record_drop(DropReason::MalformedMep);
            return;
        };

        let Some(mut guard) = self.pool.acquire_or_bind(fragment.event_number(), burst_id)
        else {
            self.counters.record_drop(DropReason::EventNumberCollision);
            return;
        };

        match guard.event_mut().add_l0(index, fragment) {
            AddOutcome::Duplicate => {
                self.counters.record_drop(DropReason::DuplicateFragment);
            }
            AddOutcome::Added => {}
            AddOutcome::Completed => self.process(guard),
        }
    }

    /// Run L1 on a slot whose L0 set just completed.
    fn process(&self, mut guard: SlotGuard<'_>) {
        guard.event_mut().begin_l1();

        let verdict = catch_verdict(|| self.trigger.compute(guard.event())).unwrap_or_else(|| {
            self.counters.record_drop(DropReason::TriggerFailure);
            L1_REJECT
        });

        guard.event_mut().record_l1(verdict);
        self.counters.record_l1(verdict);

        if verdict == L1_REJECT {
            guard.event_mut().mark_complete();
            guard.release();
        } else if verdict == L1_REQUEST_NON_ZS {
            guard.event_mut().mark_waiting_non_zs();
            if guard.event().ready_for_non_zs_l2() {
                self.l2.process_non_zs(guard);
            }
        } else {
            guard.event_mut().mark_collecting_lkr();
            // The zero-suppressed readout may already be fully in.
            if guard.event().ready_for_l2() {
                self.l2.process_normal(guard);
            }
        }
    }
}
