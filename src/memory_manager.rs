//! VM-to-collector interface: safe Rust APIs.
//!
//! This module provides the stable entry points a VM binding calls into the
//! collector. A binding typically wraps these in its own layer, adding
//! VM-specific bookkeeping and exposing them to native code where needed; the
//! functions here are deliberately thin delegations to [`Heap`] so that layer
//! has one place to look.
//!
//! The expected embedding sequence:
//!
//! 1. Create a [`HeapBuilder`] and process configuration through
//!    [`HeapBuilder::set_option`] (or `VMGC_` environment variables).
//! 2. Build the heap with the VM's [`VirtualMachine`] binding:
//!    [`HeapBuilder::build`].
//! 3. Have the mutator thread take heap access with [`acquire_access`].
//! 4. Allocate, store (always paired with [`write_barrier`]), and poll
//!    [`stop_if_necessary`] at safepoints.
//! 5. At VM exit, call [`last_chance_to_finalize`] exactly once.

use std::sync::Arc;

use crate::cell::{CellRef, TypeSpec};
use crate::finalize::{DeferredWorkId, WeakRef, WeakTable};
use crate::heap::{CollectionScope, GCRequest, Heap, HeapBuilder, HeapStatistics, Synchronousness};
use crate::roots::HandleSet;
use crate::vm::VirtualMachine;

/// Initialize a heap from a builder and a VM binding. The returned `Arc` is
/// the VM's single heap instance; clones are cheap and shared freely.
pub fn heap_init<VM: VirtualMachine>(builder: HeapBuilder, vm: VM) -> Arc<Heap<VM>> {
    builder.build(vm)
}

/// Take heap access for the calling mutator thread. Blocks while the world
/// is stopped.
///
/// Arguments:
/// * `heap`: The heap instance.
pub fn acquire_access<VM: VirtualMachine>(heap: &Heap<VM>) {
    heap.acquire_access()
}

/// Release heap access, donating any held conn to the collector thread. Call
/// before blocking in native code so collection can proceed without this
/// thread.
pub fn release_access<VM: VirtualMachine>(heap: &Heap<VM>) {
    heap.release_access()
}

/// The explicit safepoint poll. Place at interpreter dispatch boundaries and
/// function-call prologues; the allocation path polls on its own.
pub fn stop_if_necessary<VM: VirtualMachine>(heap: &Heap<VM>) {
    heap.stop_if_necessary()
}

/// Allocate a managed cell.
///
/// Arguments:
/// * `heap`: The heap instance.
/// * `spec`: The cell's type descriptor; determines visitation, finalization
///   and destruction behavior.
/// * `payload_bytes`: Payload size; the payload starts zeroed.
pub fn allocate<VM: VirtualMachine>(
    heap: &Heap<VM>,
    spec: &'static TypeSpec,
    payload_bytes: usize,
) -> CellRef {
    heap.allocate(spec, payload_bytes)
}

/// The write barrier. Every store of a managed reference into `owner` must
/// be followed by this call (or by an inlined equivalent of the fast path
/// with [`write_barrier_slow_path`] as its out-of-line half).
///
/// Arguments:
/// * `heap`: The heap instance.
/// * `owner`: The cell that was stored into.
#[inline(always)]
pub fn write_barrier<VM: VirtualMachine>(heap: &Heap<VM>, owner: CellRef) {
    heap.write_barrier(owner)
}

/// The barrier slow path, for bindings that inline the fast-path state check
/// at every store site.
pub fn write_barrier_slow_path<VM: VirtualMachine>(heap: &Heap<VM>, owner: CellRef) {
    heap.write_barrier_slow_path(owner)
}

/// Enqueue or perform a collection with explicit synchronousness.
pub fn collect<VM: VirtualMachine>(heap: &Heap<VM>, sync: Synchronousness, request: GCRequest) {
    heap.collect(sync, request)
}

/// Block until a collection satisfying `request` completes.
pub fn collect_sync<VM: VirtualMachine>(heap: &Heap<VM>, request: GCRequest) {
    heap.collect_sync(request)
}

/// Request a collection and return; the collector thread (or this thread's
/// later safepoint polls, via conn handoff) drains it.
pub fn collect_async<VM: VirtualMachine>(heap: &Heap<VM>, request: GCRequest) {
    heap.collect_async(request)
}

/// Synchronously collect with the given scope.
pub fn collect_now<VM: VirtualMachine>(heap: &Heap<VM>, scope: CollectionScope) {
    heap.collect_now(scope)
}

/// Synchronously run a full collection unless one completed recently (see
/// the `full_collection_staleness_ms` option). Returns whether one ran.
pub fn collect_now_full_if_not_done_recently<VM: VirtualMachine>(heap: &Heap<VM>) -> bool {
    heap.collect_now_full_if_not_done_recently()
}

/// Report off-heap memory owned by `cell` so the growth heuristic sees it.
///
/// Arguments:
/// * `heap`: The heap instance.
/// * `cell`: The owning cell.
/// * `bytes`: Bytes of off-heap memory newly attributable to the cell.
pub fn report_extra_memory_allocated<VM: VirtualMachine>(
    heap: &Heap<VM>,
    cell: CellRef,
    bytes: usize,
) {
    heap.report_extra_memory_allocated(cell, bytes)
}

/// Off-heap accounting with no owning cell. Prefer
/// [`report_extra_memory_allocated`]; this exists for call sites that
/// genuinely cannot name one.
pub fn deprecated_report_extra_memory<VM: VirtualMachine>(heap: &Heap<VM>, bytes: usize) {
    heap.deprecated_report_extra_memory(bytes)
}

/// Register `cell` as a strong root independent of the object graph.
/// Protection is counted; pair every call with [`unprotect`].
pub fn protect<VM: VirtualMachine>(heap: &Heap<VM>, cell: CellRef) {
    heap.protect(cell)
}

/// Remove one level of protection. Returns true when the cell is no longer
/// protected at all.
pub fn unprotect<VM: VirtualMachine>(heap: &Heap<VM>, cell: CellRef) -> bool {
    heap.unprotect(cell)
}

/// Create a named strong handle set; its live entries are roots.
pub fn new_handle_set<VM: VirtualMachine>(heap: &Heap<VM>, name: &'static str) -> Arc<HandleSet> {
    heap.new_handle_set(name)
}

/// Create a weak handle to `referent`. `on_death` runs exactly once if the
/// referent is reclaimed.
pub fn make_weak<VM: VirtualMachine>(
    heap: &Heap<VM>,
    referent: CellRef,
    on_death: Option<Box<dyn FnOnce() + Send>>,
) -> WeakRef {
    heap.make_weak(referent, on_death)
}

/// Read a weak handle: the referent, or `None` once it has been reaped.
pub fn weak_target<VM: VirtualMachine>(heap: &Heap<VM>, weak: WeakRef) -> Option<CellRef> {
    heap.weak_target(weak)
}

/// Register an auxiliary weak table; stale entries are pruned on full
/// collections.
pub fn register_weak_table<VM: VirtualMachine>(heap: &Heap<VM>, table: Arc<dyn WeakTable>) {
    heap.register_weak_table(table)
}

/// Track off-thread work that references cells without rooting them; the
/// work is cancelled if any referenced cell dies first.
pub fn register_deferred_work<VM: VirtualMachine>(
    heap: &Heap<VM>,
    cells: Vec<CellRef>,
    on_cancel: Box<dyn FnOnce() + Send>,
) -> DeferredWorkId {
    heap.register_deferred_work(cells, on_cancel)
}

/// The deferred work item ran to completion.
pub fn complete_deferred_work<VM: VirtualMachine>(heap: &Heap<VM>, id: DeferredWorkId) {
    heap.complete_deferred_work(id)
}

/// The embedder's memory-pressure signal; shrinks the allocation allowance
/// while set.
pub fn set_memory_pressure<VM: VirtualMachine>(heap: &Heap<VM>, critical: bool) {
    heap.set_memory_pressure(critical)
}

/// Live bytes known to the collector.
pub fn heap_size<VM: VirtualMachine>(heap: &Heap<VM>) -> usize {
    heap.size()
}

/// Committed bytes, including external block-allocator accounting.
pub fn heap_capacity<VM: VirtualMachine>(heap: &Heap<VM>) -> usize {
    heap.capacity()
}

/// Number of live managed cells.
pub fn object_count<VM: VirtualMachine>(heap: &Heap<VM>) -> usize {
    heap.object_count()
}

/// A diagnostics snapshot: cycle counts, pause times, per-phase totals.
pub fn statistics<VM: VirtualMachine>(heap: &Heap<VM>) -> HeapStatistics {
    heap.statistics()
}

/// Terminal, synchronous shutdown drain. Serves every outstanding ticket,
/// then forbids collection, joins the collector threads and force-sweeps the
/// heap. Call exactly once, from the mutator thread.
pub fn last_chance_to_finalize<VM: VirtualMachine>(heap: &Heap<VM>) {
    heap.last_chance_to_finalize()
}
