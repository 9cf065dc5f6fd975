//! The binding trait a VM implements to embed the collector.
//!
//! The collector never owns roots; the binding supplies them. Type-specific
//! behavior (child visitation, output constraints, finalizers) travels on
//! [`crate::cell::TypeSpec`] instead of this trait, so per-type dispatch
//! stays a table lookup rather than a generic bound.

use crate::heap::{CollectionScope, Heap};
use crate::marking::visitor::SlotVisitor;

pub trait VirtualMachine: 'static + Send + Sync + Sized {
    /// Scan the conservative roots: machine stacks, registers, or whatever
    /// shadow structure the VM maintains for the purpose. Called with the
    /// world effectively stopped; append every possible root to `visitor`.
    ///
    /// Over-approximation is sound (a false root retains garbage for one
    /// cycle); under-approximation is a use-after-free.
    fn scan_conservative_roots(&self, visitor: &mut SlotVisitor);

    /// Yield currently-executing and currently-compiling code units so the
    /// collector keeps them (and what they reference) alive.
    fn scan_code_roots(&self, _visitor: &mut SlotVisitor) {}

    /// End-phase hook, world stopped, marking complete: barrier-sweep
    /// surviving code units and delete dead ones. May consult cell liveness
    /// via [`Heap::cell_is_live`]; must not allocate or collect.
    fn sweep_dead_code(&self, _heap: &Heap<Self>) {}

    /// Post-cycle notification, delivered from the mutator's next safepoint
    /// poll rather than from inside the pause.
    fn did_finish_collection(&self, _scope: CollectionScope) {}
}
