//! Managed cells: the header the collector owns on every allocation, the
//! tricolor cell state, and the per-type dispatch table.
//!
//! A cell's *state* is barrier bookkeeping, not truth: liveness is decided by
//! the mark flag alone. The state answers one question on the store fast path,
//! "might the collector already have scanned this cell?", and it may lag
//! reality in either direction as long as the tricolor invariant is preserved.

use atomic::{Atomic, Ordering};
use bytemuck::NoUninit;
use std::alloc::Layout;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::AtomicU8;

use crate::marking::Visitor;

/// Tricolor marking status used to make the write barrier sound under
/// concurrency. The "possibly" prefixes are honest: a concurrent cycle can
/// observe a stale color, and the barrier compensates.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit, strum_macros::Display)]
pub enum CellState {
    /// Not reached this cycle.
    DefinitelyWhite = 0,
    /// Reached, not yet scanned.
    PossiblyGrey = 1,
    /// Scanned; stores into this cell must re-grey it while marking runs.
    PossiblyBlack = 2,
}

/// The per-type dispatch table. Each managed type supplies one of these as a
/// `&'static`; equality is pointer identity.
pub struct TypeSpec {
    /// Type name, used only in logging and diagnostics.
    pub name: &'static str,
    /// Visit every managed reference held by the cell.
    pub visit_children: fn(CellRef, &mut dyn Visitor),
    /// Re-examination of a black cell whose outgoing edges are produced
    /// lazily (such as code-to-data edges materialized by a compiler).
    /// Executed to a fixed point while the cell stays black.
    pub output_constraint: Option<fn(CellRef, &mut dyn Visitor)>,
    /// Executed once per surviving cell per cycle, world stopped.
    pub finalizer: Option<fn(CellRef)>,
    /// Finalizers run in ascending pass order; a finalizer that consults a
    /// peer type's post-finalization state must be placed in a later pass.
    pub finalizer_pass: u8,
    /// Executed right before the cell's storage is released.
    pub destroy: Option<fn(CellRef)>,
}

impl fmt::Debug for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeSpec").field("name", &self.name).finish()
    }
}

pub(crate) const FLAG_MARKED: u8 = 1 << 0;
pub(crate) const FLAG_IN_EDEN: u8 = 1 << 1;

/// The header placed in front of every payload. 32 bytes on 64-bit targets;
/// the payload starts right after it.
#[repr(C, align(16))]
pub struct CellHeader {
    spec: &'static TypeSpec,
    /// Total allocation size, header included.
    size: usize,
    state: Atomic<CellState>,
    flags: AtomicU8,
}

const_assert_eq!(std::mem::size_of::<CellHeader>(), 32);
const_assert!(std::mem::align_of::<CellHeader>() >= 16);

/// A reference to a managed cell. This is a plain word; copying it does not
/// keep the cell alive. Holding one across a safepoint without a root is a
/// binding bug, not something the collector can detect.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellRef(NonZeroUsize);

impl CellRef {
    pub(crate) unsafe fn from_header(header: *mut CellHeader) -> CellRef {
        debug_assert!(!header.is_null());
        CellRef(NonZeroUsize::new_unchecked(header as usize))
    }

    /// Reconstruct a cell reference from a raw word, such as one found by a
    /// conservative scan. The caller must know the word is a live cell
    /// address.
    ///
    /// # Safety
    /// `addr` must be the address of a `CellHeader` owned by a live heap.
    pub unsafe fn from_raw_address(addr: usize) -> Option<CellRef> {
        NonZeroUsize::new(addr).map(CellRef)
    }

    pub fn as_usize(self) -> usize {
        self.0.get()
    }

    fn header(self) -> &'static CellHeader {
        unsafe { &*(self.0.get() as *const CellHeader) }
    }

    /// The first byte after the header. Layout past this point belongs to the
    /// VM.
    pub fn payload(self) -> *mut u8 {
        (self.0.get() + std::mem::size_of::<CellHeader>()) as *mut u8
    }

    pub fn spec(self) -> &'static TypeSpec {
        self.header().spec
    }

    /// Total allocation size in bytes, header included.
    pub fn size(self) -> usize {
        self.header().size
    }

    pub fn state(self) -> CellState {
        self.header().state.load(Ordering::Relaxed)
    }

    pub(crate) fn store_state(self, state: CellState) {
        self.header().state.store(state, Ordering::Relaxed);
    }

    /// Attempt the `current` -> `new` state transition. Fails if another
    /// thread changed the state first.
    pub(crate) fn attempt_state(self, current: CellState, new: CellState) -> bool {
        self.header()
            .state
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_marked(self) -> bool {
        self.header().flags.load(Ordering::Acquire) & FLAG_MARKED != 0
    }

    /// Set the mark flag. Returns true if this call was the one that set it,
    /// which makes marking idempotent: only the winner pushes the cell.
    pub(crate) fn test_and_set_marked(self) -> bool {
        let header = self.header();
        // Check before fetch_or so re-marking an already-black cell stays a
        // read-only no-op on the cache line.
        if header.flags.load(Ordering::Acquire) & FLAG_MARKED != 0 {
            return false;
        }
        header.flags.fetch_or(FLAG_MARKED, Ordering::AcqRel) & FLAG_MARKED == 0
    }

    pub(crate) fn clear_marked(self) {
        self.header().flags.fetch_and(!FLAG_MARKED, Ordering::Release);
    }

    pub(crate) fn is_in_eden(self) -> bool {
        self.header().flags.load(Ordering::Relaxed) & FLAG_IN_EDEN != 0
    }

    pub(crate) fn clear_in_eden(self) {
        self.header().flags.fetch_and(!FLAG_IN_EDEN, Ordering::Relaxed);
    }

    /// Dispatch to the type's child visitation.
    pub(crate) fn visit_children(self, visitor: &mut dyn Visitor) {
        (self.spec().visit_children)(self, visitor);
    }
}

impl fmt::Debug for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {:#x}>", self.spec().name, self.0.get())
    }
}

fn cell_layout(total_size: usize) -> Layout {
    Layout::from_size_align(total_size, std::mem::align_of::<CellHeader>())
        .expect("impossible cell layout")
}

/// Allocate storage for a cell with `payload_bytes` of payload, zeroed. The
/// cell starts white, in eden, unmarked; the caller flips those as the cycle
/// in flight demands.
pub(crate) fn allocate_cell(spec: &'static TypeSpec, payload_bytes: usize) -> CellRef {
    let total = std::mem::size_of::<CellHeader>() + payload_bytes;
    let ptr = unsafe { std::alloc::alloc_zeroed(cell_layout(total)) } as *mut CellHeader;
    assert!(!ptr.is_null(), "cell allocation of {} bytes failed", total);
    unsafe {
        ptr.write(CellHeader {
            spec,
            size: total,
            state: Atomic::new(CellState::DefinitelyWhite),
            flags: AtomicU8::new(FLAG_IN_EDEN),
        });
        CellRef::from_header(ptr)
    }
}

/// Run the destroy callback and release the cell's storage. The caller must
/// have proven the cell dead (or be tearing the heap down).
pub(crate) fn destroy_cell(cell: CellRef) {
    if let Some(destroy) = cell.spec().destroy {
        destroy(cell);
    }
    let total = cell.size();
    unsafe {
        std::alloc::dealloc(cell.as_usize() as *mut u8, cell_layout(total));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn fresh_cell_is_white_unmarked_eden() {
        let cell = allocate_cell(&LEAF, 48);
        assert_eq!(cell.state(), CellState::DefinitelyWhite);
        assert!(!cell.is_marked());
        assert!(cell.is_in_eden());
        assert_eq!(cell.size(), 48 + std::mem::size_of::<CellHeader>());
        destroy_cell(cell);
    }

    #[test]
    fn mark_flag_is_set_exactly_once() {
        let cell = allocate_cell(&LEAF, 0);
        assert!(cell.test_and_set_marked());
        assert!(!cell.test_and_set_marked());
        assert!(cell.is_marked());
        cell.clear_marked();
        assert!(!cell.is_marked());
        destroy_cell(cell);
    }

    #[test]
    fn state_transition_is_a_cas() {
        let cell = allocate_cell(&LEAF, 0);
        assert!(cell.attempt_state(CellState::DefinitelyWhite, CellState::PossiblyGrey));
        assert!(!cell.attempt_state(CellState::DefinitelyWhite, CellState::PossiblyGrey));
        assert!(cell.attempt_state(CellState::PossiblyGrey, CellState::PossiblyBlack));
        assert_eq!(cell.state(), CellState::PossiblyBlack);
        destroy_cell(cell);
    }

    #[test]
    fn payload_is_zeroed_and_aligned() {
        let cell = allocate_cell(&LEAF, 64);
        let payload = cell.payload();
        assert_eq!(payload as usize % 16, 0);
        for i in 0..64 {
            assert_eq!(unsafe { *payload.add(i) }, 0);
        }
        destroy_cell(cell);
    }
}
