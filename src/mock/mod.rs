//! A mock VM binding for tests and benchmarks: slot-based managed objects, an
//! explicit shadow stack standing in for conservative stack scanning, and
//! counters observing every callback the collector makes into the binding.

pub mod graph;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cell::{CellRef, TypeSpec};
use crate::heap::{CollectionScope, Heap, HeapBuilder};
use crate::marking::visitor::SlotVisitor;
use crate::marking::Visitor;
use crate::util::constants::BYTES_IN_MBYTE;
use crate::util::options::Options;
use crate::vm::VirtualMachine;

const WORD: usize = std::mem::size_of::<usize>();

/// Cells destroyed since the counter was last reset. Global, so tests using
/// it must run under `serial_test`.
pub static DESTROYED: AtomicUsize = AtomicUsize::new(0);
/// Finalizer executions since last reset; same caveat.
pub static FINALIZED: AtomicUsize = AtomicUsize::new(0);
/// Late-pass finalizer executions observed while `FINALIZED` was still zero
/// would indicate an ordering bug; this records the `FINALIZED` value seen by
/// the first late-pass run.
pub static FINALIZED_AT_FIRST_LATE: AtomicUsize = AtomicUsize::new(usize::MAX);

pub fn reset_counters() {
    DESTROYED.store(0, Ordering::SeqCst);
    FINALIZED.store(0, Ordering::SeqCst);
    FINALIZED_AT_FIRST_LATE.store(usize::MAX, Ordering::SeqCst);
}

/// The mock binding. The shadow stack is the conservative root set: anything
/// pushed there survives; anything merely held in a Rust local across a heap
/// call does not, exactly like a register the scanner missed would not.
pub struct MockVM {
    shadow_stack: Mutex<Vec<CellRef>>,
    code_roots: Mutex<Vec<CellRef>>,
    pub code_sweeps: AtomicUsize,
    pub finished_collections: AtomicUsize,
}

impl MockVM {
    pub fn new() -> Self {
        MockVM {
            shadow_stack: Mutex::new(Vec::new()),
            code_roots: Mutex::new(Vec::new()),
            code_sweeps: AtomicUsize::new(0),
            finished_collections: AtomicUsize::new(0),
        }
    }

    pub fn push_root(&self, cell: CellRef) {
        self.shadow_stack.lock().unwrap().push(cell);
    }

    pub fn pop_root(&self) -> Option<CellRef> {
        self.shadow_stack.lock().unwrap().pop()
    }

    pub fn clear_roots(&self) {
        self.shadow_stack.lock().unwrap().clear();
    }

    pub fn add_code_root(&self, cell: CellRef) {
        self.code_roots.lock().unwrap().push(cell);
    }
}

impl Default for MockVM {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMachine for MockVM {
    fn scan_conservative_roots(&self, visitor: &mut SlotVisitor) {
        for &cell in self.shadow_stack.lock().unwrap().iter() {
            visitor.append(cell);
        }
    }

    fn scan_code_roots(&self, visitor: &mut SlotVisitor) {
        for &cell in self.code_roots.lock().unwrap().iter() {
            visitor.append(cell);
        }
    }

    fn sweep_dead_code(&self, heap: &Heap<Self>) {
        self.code_sweeps.fetch_add(1, Ordering::SeqCst);
        self.code_roots
            .lock()
            .unwrap()
            .retain(|&cell| heap.cell_is_live(cell));
    }

    fn did_finish_collection(&self, _scope: CollectionScope) {
        self.finished_collections.fetch_add(1, Ordering::SeqCst);
    }
}

// ===== The mock object model =====
//
// Payload layout: one word of slot count, then `count` words each holding a
// cell address or zero. Slots are atomics so the barrier-race harness can
// store from the mutator while markers read.

unsafe fn slot_count(cell: CellRef) -> usize {
    (cell.payload() as *const usize).read()
}

unsafe fn slot_atomic(cell: CellRef, index: usize) -> &'static AtomicUsize {
    debug_assert!(index < slot_count(cell));
    &*(cell.payload().add(WORD * (1 + index)) as *const AtomicUsize)
}

fn visit_slots(cell: CellRef, visitor: &mut dyn Visitor) {
    unsafe {
        for index in 0..slot_count(cell) {
            let word = slot_atomic(cell, index).load(Ordering::SeqCst);
            if let Some(child) = CellRef::from_raw_address(word) {
                visitor.append(child);
            }
        }
    }
}

fn no_children(_cell: CellRef, _visitor: &mut dyn Visitor) {}

fn count_destroyed(_cell: CellRef) {
    DESTROYED.fetch_add(1, Ordering::SeqCst);
}

fn early_finalizer(_cell: CellRef) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

fn late_finalizer(_cell: CellRef) {
    FINALIZED_AT_FIRST_LATE.fetch_min(FINALIZED.load(Ordering::SeqCst), Ordering::SeqCst);
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

/// Bytes of pretend off-heap memory owned by every `HUNGRY` cell.
pub const HUNGRY_EXTRA_BYTES: usize = 64 * 1024;

fn visit_hungry(cell: CellRef, visitor: &mut dyn Visitor) {
    visit_slots(cell, visitor);
    visitor.report_extra_memory_visited(HUNGRY_EXTRA_BYTES);
}

/// An ordinary slot container.
pub static OBJECT: TypeSpec = TypeSpec {
    name: "MockObject",
    visit_children: visit_slots,
    output_constraint: None,
    finalizer: None,
    finalizer_pass: 0,
    destroy: Some(count_destroyed),
};

/// A container whose outgoing edges are produced lazily: ordinary visitation
/// sees nothing, only the output constraint reveals the slots.
pub static LAZY_EDGES: TypeSpec = TypeSpec {
    name: "MockLazyEdges",
    visit_children: no_children,
    output_constraint: Some(visit_slots),
    finalizer: None,
    finalizer_pass: 0,
    destroy: Some(count_destroyed),
};

/// Carries an unconditional finalizer in the first pass.
pub static FINALIZABLE: TypeSpec = TypeSpec {
    name: "MockFinalizable",
    visit_children: visit_slots,
    output_constraint: None,
    finalizer: Some(early_finalizer),
    finalizer_pass: 0,
    destroy: Some(count_destroyed),
};

/// Carries an unconditional finalizer in the second pass; it records how many
/// finalizers had already run so ordering is observable.
pub static FINALIZABLE_LATE: TypeSpec = TypeSpec {
    name: "MockFinalizableLate",
    visit_children: visit_slots,
    output_constraint: None,
    finalizer: Some(late_finalizer),
    finalizer_pass: 1,
    destroy: Some(count_destroyed),
};

/// Owns pretend off-heap memory, reported during visitation.
pub static HUNGRY: TypeSpec = TypeSpec {
    name: "MockHungry",
    visit_children: visit_hungry,
    output_constraint: None,
    finalizer: None,
    finalizer_pass: 0,
    destroy: Some(count_destroyed),
};

/// Allocate a mock object of the given type with `slots` reference slots.
pub fn new_cell(heap: &Heap<MockVM>, spec: &'static TypeSpec, slots: usize) -> CellRef {
    let cell = heap.allocate(spec, WORD * (1 + slots));
    unsafe {
        (cell.payload() as *mut usize).write(slots);
    }
    cell
}

pub fn new_object(heap: &Heap<MockVM>, slots: usize) -> CellRef {
    new_cell(heap, &OBJECT, slots)
}

/// Store `value` into a slot, with the write barrier every reference store
/// must run.
pub fn set_slot(heap: &Heap<MockVM>, owner: CellRef, index: usize, value: Option<CellRef>) {
    unsafe {
        slot_atomic(owner, index).store(value.map_or(0, CellRef::as_usize), Ordering::SeqCst);
    }
    heap.write_barrier(owner);
}

pub fn get_slot(owner: CellRef, index: usize) -> Option<CellRef> {
    unsafe {
        let word = slot_atomic(owner, index).load(Ordering::SeqCst);
        CellRef::from_raw_address(word)
    }
}

pub fn slots_of(owner: CellRef) -> usize {
    unsafe { slot_count(owner) }
}

// ===== Fixtures =====

/// A heap plus an access-holding mutator, torn down on drop. Test options pin
/// the RAM size so growth arithmetic is machine-independent and keep the
/// marker pool small.
pub struct MutatorFixture {
    pub heap: Arc<Heap<MockVM>>,
}

impl MutatorFixture {
    pub fn create() -> Self {
        Self::create_with(|_| {})
    }

    pub fn create_with(configure: impl FnOnce(&mut Options)) -> Self {
        let mut builder = HeapBuilder::new();
        let options = builder.options_mut();
        options.ram_size = 512 * BYTES_IN_MBYTE;
        options.marker_threads = 2;
        configure(options);
        let heap = builder.build(MockVM::new());
        heap.acquire_access();
        MutatorFixture { heap }
    }

    pub fn vm(&self) -> &MockVM {
        self.heap.vm()
    }
}

impl Drop for MutatorFixture {
    fn drop(&mut self) {
        if !self.heap.is_shut_down() {
            self.heap.last_chance_to_finalize();
        }
    }
}
