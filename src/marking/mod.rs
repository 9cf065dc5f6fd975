//! The marking engine: worklists of gray cells, the visitor that drains them,
//! the helper marker pool recruited for parallel drains, and the constraint
//! set that supplies roots and re-convergence work.

pub mod constraints;
pub mod mark_stack;
pub mod markers;
pub mod visitor;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::cell::CellRef;
use mark_stack::SharedMarkStack;
use markers::MarkerMonitor;

/// The interface a type's child-visitation routine sees. Implemented by
/// [`visitor::SlotVisitor`]; types never observe the visitor's internals.
pub trait Visitor {
    /// Report one outgoing managed reference. Marks the target and queues it
    /// for scanning if this is the first time the cycle reaches it.
    fn append(&mut self, cell: CellRef);

    /// Attribute off-heap memory owned by the cell being visited to this
    /// cycle's live size, so the growth policy sees it.
    fn report_extra_memory_visited(&mut self, bytes: usize);
}

impl<F: FnMut(CellRef)> Visitor for F {
    fn append(&mut self, cell: CellRef) {
        self(cell)
    }

    fn report_extra_memory_visited(&mut self, _bytes: usize) {}
}

/// State shared by every marking agent, the write barrier, and the heap:
/// the shared mark-stack tiers and the drain-session bookkeeping.
pub(crate) struct MarkingShared {
    /// Segments donated by draining agents; helpers steal from here.
    pub(crate) collector_stack: SharedMarkStack,
    /// Cells re-grayed by the mutator's write barrier. Persists across
    /// cycles: whatever is still queued at Begin is the remembered set that
    /// seeds an eden collection.
    pub(crate) mutator_stack: SharedMarkStack,
    /// Cells re-grayed by stores that raced with marking from stopped-world
    /// contexts (constraints, finalizers). Folded back by the merge
    /// constraint. Spin-locked: the barrier path must never block on a
    /// std mutex.
    pub(crate) race_stack: spin::Mutex<Vec<CellRef>>,
    /// Park/unpark coordination for the helper markers.
    pub(crate) monitor: MarkerMonitor,
    /// Bytes of cells marked this cycle, accumulated by all agents.
    pub(crate) bytes_visited: AtomicUsize,
    /// Off-heap bytes attributed via `report_extra_memory_visited`.
    pub(crate) extra_bytes_visited: AtomicUsize,
    /// Cells marked this cycle; drives constraint-progress decisions.
    pub(crate) cells_visited: AtomicUsize,
    /// True while a drain session is open and helpers should be working.
    pub(crate) session_active: AtomicBool,
}

impl MarkingShared {
    pub fn new() -> Self {
        MarkingShared {
            collector_stack: SharedMarkStack::new(),
            mutator_stack: SharedMarkStack::new(),
            race_stack: spin::Mutex::new(Vec::new()),
            monitor: MarkerMonitor::new(),
            bytes_visited: AtomicUsize::new(0),
            extra_bytes_visited: AtomicUsize::new(0),
            cells_visited: AtomicUsize::new(0),
            session_active: AtomicBool::new(false),
        }
    }

    /// Reset the per-cycle accumulators. The mutator stack is deliberately
    /// left alone: its content is next cycle's remembered set.
    pub fn reset_for_cycle(&self) {
        self.bytes_visited.store(0, Ordering::Relaxed);
        self.extra_bytes_visited.store(0, Ordering::Relaxed);
        self.cells_visited.store(0, Ordering::Relaxed);
    }

    pub fn race_stack_is_empty(&self) -> bool {
        self.race_stack.lock().is_empty()
    }

    pub fn push_to_race_stack(&self, cell: CellRef) {
        self.race_stack.lock().push(cell);
    }

    /// All queued marking work, everywhere, is exhausted and nobody is
    /// actively draining. Only meaningful while the world is stopped: a
    /// running mutator could enqueue barrier work a moment later.
    pub fn all_stacks_empty(&self) -> bool {
        self.collector_stack.is_empty()
            && self.mutator_stack.is_empty()
            && self.race_stack_is_empty()
    }

    pub fn visited_snapshot(&self) -> usize {
        self.cells_visited.load(Ordering::SeqCst)
    }
}
