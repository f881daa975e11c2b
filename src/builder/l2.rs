//! L2 builder: the calorimeter join and final verdict.
//!
//! Calorimeter fragments may arrive before, during, or after the L0 join;
//! the slot accumulates them regardless and L2 fires only once the stage
//! conditions hold. Accepted events go to the storage sink and the slot is
//! released either way.

use std::sync::Arc;

use tracing::error;

use crate::mep::LkrFragment;
use crate::pool::{AddOutcome, EventPool, SlotGuard};
use crate::sources::SourceTable;
use crate::stats::{Counters, DropReason};
use crate::storage::StorageSink;

use super::trigger::{catch_verdict, L2Trigger, L2_REJECT};

pub struct L2Builder {
    pool: Arc<EventPool>,
    crates: Arc<SourceTable>,
    counters: Arc<Counters>,
    trigger: Arc<dyn L2Trigger>,
    storage: Arc<dyn StorageSink>,
}

impl L2Builder {
    pub fn new(
        pool: Arc<EventPool>,
        crates: Arc<SourceTable>,
        counters: Arc<Counters>,
        trigger: Arc<dyn L2Trigger>,
        storage: Arc<dyn StorageSink>,
    ) -> Self {
        Self {
            pool,
            crates,
            counters,
            trigger,
            storage,
        }
    }

    /// The expected calorimeter crate set this builder joins over.
    pub fn crates(&self) -> &SourceTable {
        &self.crates
    }

    /// Install one calorimeter fragment under the burst it arrived in.
    pub fn build(&self, fragment: LkrFragment, burst_id: u32) {
        let Some(index) = self.crates.index_of(fragment.crate_id()) else {
            self.counters.record_drop(DropReason::MalformedMep);
            return;
        };

        let Some(mut guard) = self.pool.acquire_or_bind(fragment.event_number(), burst_id)
        else {
            self.counters.record_drop(DropReason::EventNumberCollision);
            return;
        };

        if guard.event_mut().add_lkr(index, fragment) == AddOutcome::Duplicate {
            self.counters.record_drop(DropReason::DuplicateFragment);
            return;
        }

        if guard.event().ready_for_l2() {
            self.process_normal(guard);
        } else if guard.event().ready_for_non_zs_l2() {
            self.process_non_zs(guard);
        }
    }

    /// Normal L2 path: L1 passed and the zero-suppressed set is full.
    pub(crate) fn process_normal(&self, mut guard: SlotGuard<'_>) {
        guard.event_mut().begin_l2();

        let verdict = catch_verdict(|| self.trigger.compute(guard.event())).unwrap_or_else(|| {
            self.counters.record_drop(DropReason::TriggerFailure);
            L2_REJECT
        });

        self.finish(guard, verdict);
    }

    /// Follow-up L2 path: L1 requested non-zero-suppressed data and that
    /// batch is now full.
    pub(crate) fn process_non_zs(&self, mut guard: SlotGuard<'_>) {
        guard.event_mut().begin_l2();

        let verdict =
            catch_verdict(|| self.trigger.on_non_zs_data(guard.event())).unwrap_or_else(|| {
                self.counters.record_drop(DropReason::TriggerFailure);
                L2_REJECT
            });

        self.finish(guard, verdict);
    }

    fn finish(&self, mut guard: SlotGuard<'_>, verdict: u8) {
        guard.event_mut().record_l2(verdict);

        if verdict != L2_REJECT {
            match self.storage.send(guard.event()) {
                Ok(bytes) => self.counters.record_storage_send(bytes as u64),
                Err(e) => {
                    error!(
                        sink = self.storage.name(),
                        event_number = guard.event().event_number(),
                        error = %e,
                        "storage sink failed; event lost",
                    );
                    self.counters.record_drop(DropReason::StorageFailure);
                }
            }
        }

        self.counters.record_l2(verdict);
        guard.event_mut().mark_complete();
        guard.release();
    }
}
