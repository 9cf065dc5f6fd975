//! The write barrier: the code every managed reference store must run to keep
//! the tricolor invariant true while the mutator and the collector share the
//! heap.
//!
//! The invariant: once the mutator runs concurrently with marking, no black
//! cell may hold a reference the collector will never see. A store into a
//! black cell therefore re-grays the *holding* cell and queues it for
//! rescanning. Re-graying the holder (rather than chasing the stored value)
//! also gives eden collections their remembered set for free: between cycles
//! the same path queues old cells that were written into.
//!
//! The fast path is one relaxed load and a compare. The slow path is entered
//! at most once per cell per cycle, because the state it publishes
//! (`PossiblyGrey`) makes the fast path a no-op until marking re-blackens the
//! cell.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::cell::{CellRef, CellState};
use crate::marking::MarkingShared;
use crate::GlobalState;

pub(crate) struct WriteBarrier {
    global: Arc<GlobalState>,
    marking: Arc<MarkingShared>,
}

impl WriteBarrier {
    pub fn new(global: Arc<GlobalState>, marking: Arc<MarkingShared>) -> Self {
        WriteBarrier { global, marking }
    }

    /// The inline fast path. Call after storing a managed reference into
    /// `owner`.
    #[inline(always)]
    pub fn on_reference_store(&self, owner: CellRef) {
        if owner.state() == CellState::PossiblyBlack {
            self.slow_path(owner);
        }
    }

    /// The out-of-line slow path. Re-grays `owner` and queues it so the
    /// collector rescans its slots.
    #[cold]
    pub fn slow_path(&self, owner: CellRef) {
        if self.global.mutator_should_be_fenced.load(Ordering::Relaxed) {
            // Marking is concurrent with mutation right now: the relaxed
            // fast-path load may have raced with the collector blackening the
            // cell. Fence, then decide from a trustworthy state.
            fence(Ordering::SeqCst);
        }
        if owner.state() != CellState::PossiblyBlack {
            return;
        }
        if owner.attempt_state(CellState::PossiblyBlack, CellState::PossiblyGrey) {
            // Exactly one store wins the transition; it alone enqueues.
            if self.global.world.is_stopped() {
                // A store from stopped-world collector code (a constraint or
                // finalizer) raced with marking; keep it off the mutator's
                // stack so the merge constraint can account for it.
                self.marking.push_to_race_stack(owner);
            } else {
                self.marking.mutator_stack.push_cell(owner);
            }
        }
    }
}
