//! Post-mark cleanup, executed only during the End phase under a stopped
//! world: unconditional finalizers, weak handle reaping, stale weak-table
//! pruning, and cancellation of deferred work that referenced dead cells.

use std::sync::Mutex;

use crate::cell::CellRef;

/// The registry of cells whose types carry an unconditional finalizer.
/// Cells are enrolled at allocation and leave when they die.
pub(crate) struct FinalizerSet {
    cells: Mutex<Vec<CellRef>>,
}

impl FinalizerSet {
    pub fn new() -> Self {
        FinalizerSet {
            cells: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, cell: CellRef) {
        debug_assert!(cell.spec().finalizer.is_some());
        self.cells.lock().unwrap().push(cell);
    }

    pub fn len(&self) -> usize {
        self.cells.lock().unwrap().len()
    }

    /// Run every surviving cell's finalizer exactly once, in ascending
    /// `finalizer_pass` order, and drop dead cells from the registry. A
    /// finalizer in pass N may rely on every pass < N having completed; that
    /// fixed ordering replaces a runtime dependency graph.
    pub fn finalize_survivors<L: Fn(CellRef) -> bool>(&self, is_live: L) -> usize {
        let mut cells = self.cells.lock().unwrap();
        cells.retain(|&cell| is_live(cell));

        let mut survivors: Vec<CellRef> = cells.clone();
        // The registry stays unsorted; ordering matters only for this walk.
        survivors.sort_by_key(|cell| cell.spec().finalizer_pass);
        drop(cells);

        let count = survivors.len();
        for cell in survivors {
            let finalizer = cell
                .spec()
                .finalizer
                .expect("cell enrolled for finalization has no finalizer");
            finalizer(cell);
        }
        count
    }

    /// Forget everything. Shutdown only: the cells are about to be destroyed
    /// wholesale.
    pub fn clear(&self) {
        self.cells.lock().unwrap().clear();
    }
}

/// A handle to a weak reference created by the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeakRef(usize);

struct WeakSlot {
    referent: Option<CellRef>,
    /// Invoked exactly once, when the referent is found dead.
    on_death: Option<Box<dyn FnOnce() + Send>>,
}

/// Weak handles: slots the collector clears when the referent fails to
/// survive a cycle. Holding a `WeakRef` does not keep the referent alive.
pub(crate) struct WeakHandleSet {
    slots: Mutex<WeakSlots>,
}

struct WeakSlots {
    entries: Vec<WeakSlot>,
    free: Vec<usize>,
}

impl WeakHandleSet {
    pub fn new() -> Self {
        WeakHandleSet {
            slots: Mutex::new(WeakSlots {
                entries: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    pub fn make(&self, referent: CellRef, on_death: Option<Box<dyn FnOnce() + Send>>) -> WeakRef {
        let mut slots = self.slots.lock().unwrap();
        let slot = WeakSlot {
            referent: Some(referent),
            on_death,
        };
        if let Some(index) = slots.free.pop() {
            slots.entries[index] = slot;
            WeakRef(index)
        } else {
            slots.entries.push(slot);
            WeakRef(slots.entries.len() - 1)
        }
    }

    /// The referent, or `None` once it has been reaped.
    pub fn get(&self, weak: WeakRef) -> Option<CellRef> {
        self.slots.lock().unwrap().entries[weak.0].referent
    }

    /// Drop a weak handle without touching the referent.
    pub fn release(&self, weak: WeakRef) {
        let mut slots = self.slots.lock().unwrap();
        slots.entries[weak.0].referent = None;
        slots.entries[weak.0].on_death = None;
        slots.free.push(weak.0);
    }

    /// Clear every handle whose referent did not survive, invoking each death
    /// callback exactly once. Returns the number of reaped handles.
    pub fn reap<L: Fn(CellRef) -> bool>(&self, is_live: L) -> usize {
        let mut dead_callbacks = Vec::new();
        {
            let mut slots = self.slots.lock().unwrap();
            for slot in slots.entries.iter_mut() {
                if let Some(referent) = slot.referent {
                    if !is_live(referent) {
                        slot.referent = None;
                        if let Some(callback) = slot.on_death.take() {
                            dead_callbacks.push(callback);
                        }
                    }
                }
            }
        }
        // Callbacks run outside the slot lock; they may create new weaks.
        let reaped = dead_callbacks.len();
        for callback in dead_callbacks {
            callback();
        }
        reaped
    }

    /// A convergence-time integrity pass: every populated slot must point at
    /// a cell that is either already marked or still eligible for marking.
    /// Runs once per cycle.
    pub fn fixup(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .entries
            .iter()
            .filter(|slot| slot.referent.is_some())
            .count()
    }

    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap();
        slots.entries.clear();
        slots.free.clear();
    }
}

/// An auxiliary weak table owned by the embedder (an atom table, a
/// structure-transition cache). Registered tables are pruned of entries whose
/// keys died, but only on full collections: eden cycles cannot prove an old
/// key dead.
pub trait WeakTable: Send + Sync {
    /// Remove entries whose cells failed `is_live`.
    fn prune_dead_entries(&self, is_live: &dyn Fn(CellRef) -> bool);
}

/// Identifies a deferred work item for completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredWorkId(usize);

struct DeferredItem {
    cells: Vec<CellRef>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

/// Off-thread work (a background compilation, a pending callback) that holds
/// cell references without rooting them. When a referenced cell dies, the
/// item is cancelled rather than left to dereference a freed cell.
pub(crate) struct DeferredWorkSet {
    items: Mutex<Vec<Option<DeferredItem>>>,
}

impl DeferredWorkSet {
    pub fn new() -> Self {
        DeferredWorkSet {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn register(
        &self,
        cells: Vec<CellRef>,
        on_cancel: Box<dyn FnOnce() + Send>,
    ) -> DeferredWorkId {
        let mut items = self.items.lock().unwrap();
        items.push(Some(DeferredItem {
            cells,
            on_cancel: Some(on_cancel),
        }));
        DeferredWorkId(items.len() - 1)
    }

    /// The work ran to completion; stop tracking it.
    pub fn complete(&self, id: DeferredWorkId) {
        let mut items = self.items.lock().unwrap();
        items[id.0] = None;
    }

    /// Cancel every item that references a dead cell. Returns the number of
    /// cancellations.
    pub fn cancel_dead<L: Fn(CellRef) -> bool>(&self, is_live: L) -> usize {
        let mut cancellations = Vec::new();
        {
            let mut items = self.items.lock().unwrap();
            for entry in items.iter_mut() {
                let cancel = match entry {
                    Some(item) => !item.cells.iter().all(|&cell| is_live(cell)),
                    None => false,
                };
                if cancel {
                    let mut item = entry.take().unwrap();
                    if let Some(callback) = item.on_cancel.take() {
                        cancellations.push(callback);
                    }
                }
            }
        }
        let count = cancellations.len();
        for callback in cancellations {
            callback();
        }
        count
    }

    pub fn clear(&self) {
        self.items.lock().unwrap().clear();
    }
}
