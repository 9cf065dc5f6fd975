//! The precise-allocation registry: every live cell, segregated by
//! generation. Allocation lands in eden; surviving an eden collection
//! promotes to the old list; a full collection sweeps both.
//!
//! Marking never consults the registry (liveness lives in the cell header);
//! the registry exists so sweeping can walk exactly the population the
//! cycle's scope covers, and so mark flags can be cleared wholesale when a
//! full cycle begins.

use crate::cell::{destroy_cell, CellRef, CellState};
use crate::heap::CollectionScope;

/// What a sweep did, for logging and limit recomputation.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SweepTally {
    pub swept_cells: usize,
    pub swept_bytes: usize,
    pub promoted_cells: usize,
}

pub(crate) struct CellRegistry {
    eden: Vec<CellRef>,
    old: Vec<CellRef>,
    eden_bytes: usize,
    old_bytes: usize,
}

impl CellRegistry {
    pub fn new() -> Self {
        CellRegistry {
            eden: Vec::new(),
            old: Vec::new(),
            eden_bytes: 0,
            old_bytes: 0,
        }
    }

    pub fn add(&mut self, cell: CellRef) {
        debug_assert!(cell.is_in_eden());
        self.eden_bytes += cell.size();
        self.eden.push(cell);
    }

    pub fn object_count(&self) -> usize {
        self.eden.len() + self.old.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.eden_bytes + self.old_bytes
    }

    /// Reset every cell to unmarked and white. Only a full cycle does this;
    /// an eden cycle relies on old cells keeping last cycle's marks.
    pub fn clear_all_marks(&self) {
        for &cell in self.eden.iter().chain(self.old.iter()) {
            cell.clear_marked();
            cell.store_state(CellState::DefinitelyWhite);
        }
    }

    /// Reclaim unmarked cells within `scope`. Eden survivors are promoted;
    /// old cells are only touched by a full sweep.
    pub fn sweep(&mut self, scope: CollectionScope) -> SweepTally {
        let mut tally = SweepTally::default();

        let mut eden = std::mem::take(&mut self.eden);
        for cell in eden.drain(..) {
            if cell.is_marked() {
                cell.clear_in_eden();
                self.old_bytes += cell.size();
                self.old.push(cell);
                tally.promoted_cells += 1;
            } else {
                tally.swept_cells += 1;
                tally.swept_bytes += cell.size();
                destroy_cell(cell);
            }
        }
        self.eden_bytes = 0;

        if scope == CollectionScope::Full {
            let mut old_bytes = 0;
            let mut old = std::mem::take(&mut self.old);
            for cell in old.drain(..) {
                if cell.is_marked() {
                    old_bytes += cell.size();
                    self.old.push(cell);
                } else {
                    tally.swept_cells += 1;
                    tally.swept_bytes += cell.size();
                    destroy_cell(cell);
                }
            }
            self.old_bytes = old_bytes;
        }

        tally
    }

    /// Destroy every cell unconditionally. Shutdown only.
    pub fn sweep_everything(&mut self) -> SweepTally {
        let mut tally = SweepTally::default();
        for cell in self.eden.drain(..).chain(self.old.drain(..)) {
            tally.swept_cells += 1;
            tally.swept_bytes += cell.size();
            destroy_cell(cell);
        }
        self.eden_bytes = 0;
        self.old_bytes = 0;
        tally
    }
}

/// Scope-aware liveness: an eden collection cannot prove an old cell dead.
pub(crate) fn cell_is_live(cell: CellRef, scope: CollectionScope) -> bool {
    cell.is_marked() || (scope == CollectionScope::Eden && !cell.is_in_eden())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{allocate_cell, TypeSpec};
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
    fn eden_sweep_promotes_marked_cells() {
        let mut registry = CellRegistry::new();
        let survivor = allocate_cell(&LEAF, 0);
        let garbage = allocate_cell(&LEAF, 0);
        registry.add(survivor);
        registry.add(garbage);

        survivor.test_and_set_marked();
        let tally = registry.sweep(CollectionScope::Eden);

        assert_eq!(tally.promoted_cells, 1);
        assert_eq!(tally.swept_cells, 1);
        assert_eq!(registry.object_count(), 1);
        assert!(!survivor.is_in_eden());
        destroy_cell(survivor);
    }

    #[test]
    fn full_sweep_reclaims_old_cells() {
        let mut registry = CellRegistry::new();
        let cell = allocate_cell(&LEAF, 0);
        registry.add(cell);

        cell.test_and_set_marked();
        registry.sweep(CollectionScope::Eden);
        assert_eq!(registry.object_count(), 1);

        // The next full cycle clears marks; the cell stays unmarked and dies.
        registry.clear_all_marks();
        let tally = registry.sweep(CollectionScope::Full);
        assert_eq!(tally.swept_cells, 1);
        assert_eq!(registry.object_count(), 0);
        assert_eq!(registry.total_bytes(), 0);
    }

    #[test]
    fn eden_scope_considers_old_cells_live() {
        let mut registry = CellRegistry::new();
        let old = allocate_cell(&LEAF, 0);
        registry.add(old);
        old.test_and_set_marked();
        registry.sweep(CollectionScope::Eden);
        old.clear_marked();

        assert!(cell_is_live(old, CollectionScope::Eden));
        assert!(!cell_is_live(old, CollectionScope::Full));
        destroy_cell(old);
    }
}
