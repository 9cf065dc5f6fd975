//! Mark stacks: the append-only worklists of gray cells.
//!
//! Two tiers. The local tier is owned by one agent and touched without any
//! synchronization. The shared tier moves whole segments between agents, so
//! contention is paid once per `MARK_STACK_SEGMENT_SIZE` cells rather than
//! once per cell.

use crossbeam::deque::{Injector, Steal};

use crate::cell::CellRef;
use crate::util::constants::MARK_STACK_SEGMENT_SIZE;

/// A segment of cells in flight between agents.
pub(crate) type Segment = Vec<CellRef>;

/// An agent-private mark stack. Single-owner; lock-free from the owner's
/// perspective because nobody else ever sees it.
pub(crate) struct MarkStack {
    slots: Vec<CellRef>,
}

impl MarkStack {
    pub fn new() -> Self {
        MarkStack {
            slots: Vec::with_capacity(MARK_STACK_SEGMENT_SIZE),
        }
    }

    pub fn push(&mut self, cell: CellRef) {
        self.slots.push(cell);
    }

    pub fn pop(&mut self) -> Option<CellRef> {
        self.slots.pop()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Split off roughly half of the stack, in segment-sized chunks, for
    /// donation to idle agents. Returns `None` when the stack is too small to
    /// be worth sharing.
    pub fn take_donation(&mut self) -> Option<Segment> {
        if self.slots.len() < 2 * MARK_STACK_SEGMENT_SIZE {
            return None;
        }
        let keep = self.slots.len() / 2;
        Some(self.slots.split_off(keep))
    }

    /// Adopt a stolen segment.
    pub fn adopt(&mut self, mut segment: Segment) {
        self.slots.append(&mut segment);
    }
}

/// A shared mark-stack tier. Several exist: the shared-collector stack that
/// parallel agents steal from, and the shared-mutator stack that the write
/// barrier appends to.
pub(crate) struct SharedMarkStack {
    segments: Injector<Segment>,
}

impl SharedMarkStack {
    pub fn new() -> Self {
        SharedMarkStack {
            segments: Injector::new(),
        }
    }

    pub fn donate(&self, segment: Segment) {
        debug_assert!(!segment.is_empty());
        self.segments.push(segment);
    }

    /// Push one cell. The barrier uses this; it cannot batch because it must
    /// publish the gray cell before the mutator's store becomes observable.
    pub fn push_cell(&self, cell: CellRef) {
        self.segments.push(vec![cell]);
    }

    pub fn steal(&self) -> Option<Segment> {
        loop {
            match self.segments.steal() {
                Steal::Success(segment) => return Some(segment),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Drain every queued segment into a vector. Used by the merge constraint
    /// and by shutdown.
    pub fn drain_all(&self) -> Vec<CellRef> {
        let mut cells = Vec::new();
        while let Some(mut segment) = self.steal() {
            cells.append(&mut segment);
        }
        cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{allocate_cell, destroy_cell, TypeSpec};
    use crate::marking::Visitor;

    fn no_children(_cell: CellRef, _visitor: &mut dyn Visitor) {}

    static LEAF: TypeSpec = TypeSpec {
        name: "Leaf",
        visit_children: no_children,
        output_constraint: None,
        finalizer: None,
        finalizer_pass: 0,
        destroy: None,
    };

    #[test]
    fn local_stack_is_lifo() {
        let a = allocate_cell(&LEAF, 0);
        let b = allocate_cell(&LEAF, 0);
        let mut stack = MarkStack::new();
        stack.push(a);
        stack.push(b);
        assert_eq!(stack.pop(), Some(b));
        assert_eq!(stack.pop(), Some(a));
        assert_eq!(stack.pop(), None);
        destroy_cell(a);
        destroy_cell(b);
    }

    #[test]
    fn donation_keeps_half() {
        let cells: Vec<_> = (0..4 * MARK_STACK_SEGMENT_SIZE)
            .map(|_| allocate_cell(&LEAF, 0))
            .collect();
        let mut stack = MarkStack::new();
        for &cell in &cells {
            stack.push(cell);
        }
        let donated = stack.take_donation().unwrap();
        assert_eq!(donated.len(), 2 * MARK_STACK_SEGMENT_SIZE);
        assert_eq!(stack.len(), 2 * MARK_STACK_SEGMENT_SIZE);
        for cell in cells {
            destroy_cell(cell);
        }
    }

    #[test]
    fn small_stacks_refuse_donation() {
        let cell = allocate_cell(&LEAF, 0);
        let mut stack = MarkStack::new();
        stack.push(cell);
        assert!(stack.take_donation().is_none());
        destroy_cell(cell);
    }

    #[test]
    fn shared_stack_round_trips_segments() {
        let a = allocate_cell(&LEAF, 0);
        let shared = SharedMarkStack::new();
        assert!(shared.is_empty());
        shared.push_cell(a);
        assert!(!shared.is_empty());
        let segment = shared.steal().unwrap();
        assert_eq!(segment, vec![a]);
        assert!(shared.steal().is_none());
        destroy_cell(a);
    }
}
