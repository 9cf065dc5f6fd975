//! The marking agent. One `SlotVisitor` is the primary agent owned by the
//! conn holder; the marker pool runs one more per helper thread.
//!
//! Draining visits one gray cell at a time: transition it to black, dispatch
//! the type's child visitation (which appends newly reached cells), repeat
//! until the local and shared stacks are empty or the deadline passes.
//! Marking is idempotent: the mark flag is test-and-set, so re-appending an
//! already-marked cell neither grows the stack nor changes state.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use super::mark_stack::{MarkStack, Segment};
use super::markers::PrimaryWait;
use super::{MarkingShared, Visitor};
use crate::cell::{CellRef, CellState};
use crate::util::constants::MARK_STACK_DONATION_THRESHOLD;

/// How often the drain loop consults the clock, in visited cells.
const DEADLINE_CHECK_STRIDE: usize = 16;

/// Why a drain returned.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DrainOutcome {
    /// Every reachable stack is empty and no helper is active.
    Exhausted,
    /// The time budget elapsed with work remaining.
    DeadlinePassed,
}

/// A marking agent: a local mark stack plus the protocol for pushing
/// discovered references and popping work until empty.
pub struct SlotVisitor {
    local: MarkStack,
    shared: Arc<MarkingShared>,
    /// Unflushed per-drain accounting.
    bytes_visited: usize,
    extra_bytes_visited: usize,
    cells_visited: usize,
    is_helper: bool,
}

impl Visitor for SlotVisitor {
    fn append(&mut self, cell: CellRef) {
        if cell.test_and_set_marked() {
            cell.store_state(CellState::PossiblyGrey);
            self.bytes_visited += cell.size();
            self.cells_visited += 1;
            self.local.push(cell);
        }
    }

    fn report_extra_memory_visited(&mut self, bytes: usize) {
        self.extra_bytes_visited += bytes;
    }
}

impl SlotVisitor {
    pub(crate) fn new_primary(shared: Arc<MarkingShared>) -> Self {
        SlotVisitor {
            local: MarkStack::new(),
            shared,
            bytes_visited: 0,
            extra_bytes_visited: 0,
            cells_visited: 0,
            is_helper: false,
        }
    }

    pub(crate) fn new_helper(shared: Arc<MarkingShared>) -> Self {
        SlotVisitor {
            local: MarkStack::new(),
            shared,
            bytes_visited: 0,
            extra_bytes_visited: 0,
            cells_visited: 0,
            is_helper: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Queue an already-marked cell for (re-)scanning. This is how barrier
    /// re-grayed cells re-enter the worklist: the mark check in `append`
    /// would wrongly skip them.
    pub(crate) fn append_for_rescan(&mut self, cell: CellRef) {
        if cell.test_and_set_marked() {
            // A full cycle reset this cell to white after the barrier queued
            // it; it is a first visit after all.
            self.bytes_visited += cell.size();
            self.cells_visited += 1;
        }
        cell.store_state(CellState::PossiblyGrey);
        self.local.push(cell);
    }

    /// Pop-and-scan one cell. Skips cells something else already scanned.
    fn visit_cell(&mut self, cell: CellRef) {
        if cell.attempt_state(CellState::PossiblyGrey, CellState::PossiblyBlack) {
            cell.visit_children(self);
        }
        // Losing the transition means the cell is already black: a duplicate
        // stack entry, dropped on the floor.
    }

    /// Drain with the helper pool recruited: open a session, donate excess
    /// segments, steal back, and wait out the helpers before returning.
    /// On return no helper is active, so the caller may trust
    /// `did_reach_termination`.
    pub(crate) fn drain_in_parallel(&mut self, deadline: Instant) -> DrainOutcome {
        debug_assert!(!self.is_helper);
        let shared = self.shared.clone();
        shared.session_active.store(true, Ordering::SeqCst);
        shared.monitor.notify_work_available();

        let mut outcome = DrainOutcome::Exhausted;
        'session: loop {
            let mut visited = 0usize;
            loop {
                if self.local.len() >= MARK_STACK_DONATION_THRESHOLD {
                    if let Some(segment) = self.local.take_donation() {
                        shared.collector_stack.donate(segment);
                        shared.monitor.notify_work_available();
                    }
                }
                match self.local.pop() {
                    Some(cell) => self.visit_cell(cell),
                    None => break,
                }
                visited += 1;
                if visited % DEADLINE_CHECK_STRIDE == 0 && Instant::now() >= deadline {
                    outcome = DrainOutcome::DeadlinePassed;
                    break 'session;
                }
            }
            // Local stack is empty; steal a donated segment back.
            if let Some(segment) = shared.collector_stack.steal() {
                self.local.adopt(segment);
                continue;
            }
            match shared.monitor.wait_for_helpers(&shared, deadline) {
                PrimaryWait::WorkAvailable => continue,
                PrimaryWait::Quiescent => {
                    outcome = DrainOutcome::Exhausted;
                    break;
                }
                PrimaryWait::DeadlinePassed => {
                    outcome = DrainOutcome::DeadlinePassed;
                    break;
                }
            }
        }

        shared.session_active.store(false, Ordering::SeqCst);
        shared.monitor.notify_work_available();
        shared.monitor.wait_until_inactive();
        self.flush_accounting();
        outcome
    }

    /// Like `drain_in_parallel`, but tuned for the concurrent phase: the
    /// world is running, so exhausting the stacks proves nothing and the
    /// deadline is the only exit that matters to the caller.
    pub(crate) fn drain_in_parallel_passively(&mut self, deadline: Instant) -> DrainOutcome {
        self.drain_in_parallel(deadline)
    }

    /// Helper-side draining of one adopted segment and everything discovered
    /// from it. Bails out (donating the remainder) when the session closes.
    pub(crate) fn drain_adopted_segment(&mut self, segment: Segment) {
        debug_assert!(self.is_helper);
        let shared = self.shared.clone();
        self.local.adopt(segment);
        let mut visited = 0usize;
        loop {
            if visited % DEADLINE_CHECK_STRIDE == 0
                && !shared.session_active.load(Ordering::SeqCst)
            {
                break;
            }
            if self.local.len() >= MARK_STACK_DONATION_THRESHOLD {
                if let Some(donation) = self.local.take_donation() {
                    shared.collector_stack.donate(donation);
                    shared.monitor.notify_work_available();
                }
            }
            match self.local.pop() {
                Some(cell) => self.visit_cell(cell),
                None => break,
            }
            visited += 1;
        }
        // Session closed with work in hand: give it back for the next window.
        if !self.local.is_empty() {
            let mut remainder = Vec::with_capacity(self.local.len());
            while let Some(cell) = self.local.pop() {
                remainder.push(cell);
            }
            shared.collector_stack.donate(remainder);
        }
        self.flush_accounting();
    }

    /// Global termination: my stack is empty, every shared stack is empty,
    /// and no helper is active. The active-marker check is what defeats the
    /// race where one agent runs dry while another is about to donate.
    /// Only trustworthy while the world is stopped.
    pub(crate) fn did_reach_termination(&self) -> bool {
        self.local.is_empty()
            && self.shared.all_stacks_empty()
            && self.shared.monitor.active_markers() == 0
    }

    /// Publish per-drain accounting into the shared cycle totals.
    fn flush_accounting(&mut self) {
        if self.bytes_visited > 0 {
            self.shared
                .bytes_visited
                .fetch_add(self.bytes_visited, Ordering::SeqCst);
            self.bytes_visited = 0;
        }
        if self.extra_bytes_visited > 0 {
            self.shared
                .extra_bytes_visited
                .fetch_add(self.extra_bytes_visited, Ordering::SeqCst);
            self.extra_bytes_visited = 0;
        }
        if self.cells_visited > 0 {
            self.shared
                .cells_visited
                .fetch_add(self.cells_visited, Ordering::SeqCst);
            self.cells_visited = 0;
        }
    }

    /// Drop any queued work. Used only by shutdown.
    pub(crate) fn abandon(&mut self) {
        self.local.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{allocate_cell, destroy_cell, TypeSpec};
    use std::time::Duration;

    fn no_children(_cell: CellRef, _visitor: &mut dyn Visitor) {}

    static LEAF: TypeSpec = TypeSpec {
        name: "Leaf",
        visit_children: no_children,
        output_constraint: None,
        finalizer: None,
        finalizer_pass: 0,
        destroy: None,
    };

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn append_marks_and_greys() {
        let shared = Arc::new(MarkingShared::new());
        let mut visitor = SlotVisitor::new_primary(shared);
        let cell = allocate_cell(&LEAF, 0);

        visitor.append(cell);
        assert!(cell.is_marked());
        assert_eq!(cell.state(), CellState::PossiblyGrey);
        assert!(!visitor.is_empty());

        // No markers are attached to this shared state; the session drains
        // on the primary alone.
        assert_eq!(
            visitor.drain_in_parallel(far_deadline()),
            DrainOutcome::Exhausted
        );
        assert_eq!(cell.state(), CellState::PossiblyBlack);
        assert!(visitor.did_reach_termination());
        destroy_cell(cell);
    }

    #[test]
    fn appending_a_black_cell_is_a_no_op() {
        let shared = Arc::new(MarkingShared::new());
        let mut visitor = SlotVisitor::new_primary(shared);
        let cell = allocate_cell(&LEAF, 0);

        visitor.append(cell);
        assert_eq!(
            visitor.drain_in_parallel(far_deadline()),
            DrainOutcome::Exhausted
        );
        assert_eq!(cell.state(), CellState::PossiblyBlack);

        // Second append: mark flag already set, so nothing is queued.
        visitor.append(cell);
        assert!(visitor.is_empty());
        assert_eq!(cell.state(), CellState::PossiblyBlack);
        destroy_cell(cell);
    }

    #[test]
    fn rescan_path_requeues_marked_cells() {
        let shared = Arc::new(MarkingShared::new());
        let mut visitor = SlotVisitor::new_primary(shared);
        let cell = allocate_cell(&LEAF, 0);

        visitor.append(cell);
        visitor.drain_in_parallel(far_deadline());
        // Simulate a barrier re-gray.
        assert!(cell.attempt_state(CellState::PossiblyBlack, CellState::PossiblyGrey));
        visitor.append_for_rescan(cell);
        assert!(!visitor.is_empty());
        visitor.drain_in_parallel(far_deadline());
        assert_eq!(cell.state(), CellState::PossiblyBlack);
        destroy_cell(cell);
    }

    #[test]
    fn accounting_flushes_to_shared_totals() {
        let shared = Arc::new(MarkingShared::new());
        let mut visitor = SlotVisitor::new_primary(shared.clone());
        let a = allocate_cell(&LEAF, 16);
        let b = allocate_cell(&LEAF, 16);

        visitor.append(a);
        visitor.append(b);
        visitor.drain_in_parallel(far_deadline());

        assert_eq!(shared.cells_visited.load(Ordering::SeqCst), 2);
        assert_eq!(
            shared.bytes_visited.load(Ordering::SeqCst),
            a.size() + b.size()
        );
        destroy_cell(a);
        destroy_cell(b);
    }
}
