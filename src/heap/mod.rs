//! The heap orchestrator. `Heap` owns every collector component (the phase
//! machine, the request queue, the marking engine, the growth policy, the
//! registries) and is the only module allowed to mutate cross-component
//! shared state. Collaborators talk to it through the public methods here
//! (or the free functions in [`crate::memory_manager`]); nothing hands out
//! raw access to the world word, the phase, or the mark stacks.

pub mod builder;
pub(crate) mod growth;
pub(crate) mod pacing;
pub mod phases;
pub(crate) mod registry;
pub mod requests;
pub mod stats;
pub(crate) mod thread;

use atomic::Atomic;
use bytemuck::NoUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::barrier::WriteBarrier;
use crate::cell::{self, CellRef, CellState, TypeSpec};
use crate::finalize::{
    DeferredWorkId, DeferredWorkSet, FinalizerSet, WeakHandleSet, WeakRef, WeakTable,
};
use crate::marking::constraints::{ConstraintVolatility, MarkingConstraintSet};
use crate::marking::visitor::SlotVisitor;
use crate::marking::MarkingShared;
use crate::roots::{HandleSet, ProtectedValues};
use crate::safepoint::Safepoint;
use crate::util::options::Options;
use crate::vm::VirtualMachine;
use crate::GlobalState;

pub use builder::HeapBuilder;
pub use phases::CollectorPhase;
pub use requests::{GCRequest, Synchronousness};
pub use stats::HeapStatistics;

use growth::GrowthPolicy;
use pacing::SpaceTimeScheduler;
use phases::Conductor;
use registry::CellRegistry;
use requests::RequestQueue;
use stats::HeapStats;
use thread::CollectorThread;

use crate::marking::markers::MarkerPool;

/// Generational scope of one cycle, chosen in Begin and fixed until End.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit, strum_macros::Display)]
pub enum CollectionScope {
    /// Collect only cells allocated (or re-grayed) since the last full
    /// collection.
    Eden = 0,
    /// Rescan and sweep everything.
    Full = 1,
}

/// State owned by whichever side currently conducts the cycle. Guarded by a
/// mutex that, by protocol, only the conn holder takes; constraint executors
/// run under it and must never take it themselves.
pub(crate) struct CollectorState<VM: VirtualMachine> {
    pub(crate) visitor: SlotVisitor,
    pub(crate) constraints: MarkingConstraintSet<VM>,
    pub(crate) in_flight: Option<(u64, GCRequest)>,
    pub(crate) cycle_began_at: Option<Instant>,
}

pub struct Heap<VM: VirtualMachine> {
    vm: VM,
    options: Arc<Options>,
    pub(crate) global: Arc<GlobalState>,
    pub(crate) marking: Arc<MarkingShared>,
    barrier: WriteBarrier,
    pub(crate) safepoint: Safepoint,
    pub(crate) registry: Mutex<CellRegistry>,
    pub(crate) requests: RequestQueue,
    pub(crate) growth: GrowthPolicy,
    pub(crate) pacing: SpaceTimeScheduler,
    pub(crate) stats: HeapStats,
    pub(crate) phase: Atomic<CollectorPhase>,
    pub(crate) next_phase: Atomic<CollectorPhase>,
    pub(crate) collector: Mutex<CollectorState<VM>>,
    handle_sets: Mutex<Vec<Arc<HandleSet>>>,
    protected: ProtectedValues,
    pub(crate) finalizers: FinalizerSet,
    pub(crate) weak_handles: WeakHandleSet,
    pub(crate) weak_tables: Mutex<Vec<Arc<dyn WeakTable>>>,
    pub(crate) deferred_work: DeferredWorkSet,
    pub(crate) output_cells: Mutex<Vec<CellRef>>,
    pub(crate) collector_thread: CollectorThread,
    marker_pool: MarkerPool,
    pub(crate) concurrent_epoch: AtomicU64,
    pub(crate) last_full_collection: Mutex<Option<Instant>>,
    /// Bytes committed by an external block allocator, accounted through
    /// `did_allocate_block` / `did_free_block`.
    block_bytes: AtomicUsize,
    is_shut_down: AtomicBool,
}

/// RAII guard for a scoped GC-deferral region. While any guard lives,
/// `collect_if_necessary_or_defer` records rather than starts collections;
/// dropping the last guard starts the owed collection.
pub struct DeferGC<'heap, VM: VirtualMachine> {
    heap: &'heap Heap<VM>,
}

impl<VM: VirtualMachine> Drop for DeferGC<'_, VM> {
    fn drop(&mut self) {
        let prev = self.heap.global.defer_depth.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unbalanced GC deferral");
        if prev == 1
            && self
                .heap
                .global
                .deferred_collection_requested
                .swap(false, Ordering::AcqRel)
        {
            self.heap.collect(Synchronousness::Async, GCRequest::default());
        }
    }
}

impl<VM: VirtualMachine> Heap<VM> {
    pub(crate) fn build(vm: VM, options: Options) -> Arc<Heap<VM>> {
        let options = Arc::new(options);
        let global = Arc::new(GlobalState::new());
        let marking = Arc::new(MarkingShared::new());
        let heap = Arc::new(Heap {
            vm,
            barrier: WriteBarrier::new(global.clone(), marking.clone()),
            safepoint: Safepoint::new(),
            registry: Mutex::new(CellRegistry::new()),
            requests: RequestQueue::new(),
            growth: GrowthPolicy::new(options.clone()),
            pacing: SpaceTimeScheduler::new(options.clone()),
            stats: HeapStats::new(),
            phase: Atomic::new(CollectorPhase::NotRunning),
            next_phase: Atomic::new(CollectorPhase::NotRunning),
            collector: Mutex::new(CollectorState {
                visitor: SlotVisitor::new_primary(marking.clone()),
                constraints: MarkingConstraintSet::new(),
                in_flight: None,
                cycle_began_at: None,
            }),
            handle_sets: Mutex::new(Vec::new()),
            protected: ProtectedValues::new(),
            finalizers: FinalizerSet::new(),
            weak_handles: WeakHandleSet::new(),
            weak_tables: Mutex::new(Vec::new()),
            deferred_work: DeferredWorkSet::new(),
            output_cells: Mutex::new(Vec::new()),
            collector_thread: CollectorThread::new(),
            marker_pool: MarkerPool::spawn(&marking, options.marker_threads),
            concurrent_epoch: AtomicU64::new(0),
            last_full_collection: Mutex::new(None),
            block_bytes: AtomicUsize::new(0),
            is_shut_down: AtomicBool::new(false),
            global,
            marking,
            options,
        });
        heap.add_core_constraints();
        heap.collector_thread.start(heap.clone());
        heap
    }

    /// Install the standard root and convergence constraints, in order. The
    /// conservative scan goes first: it doubles as the Begin bootstrap.
    fn add_core_constraints(&self) {
        let mut collector = self.collector.lock().unwrap();
        let constraints = &mut collector.constraints;
        constraints.add(
            "Cs",
            "conservative scan",
            ConstraintVolatility::SeldomGreyed,
            Box::new(|heap: &Heap<VM>, visitor: &mut SlotVisitor| {
                heap.vm.scan_conservative_roots(visitor);
            }),
        );
        constraints.add(
            "Msr",
            "misc small roots",
            ConstraintVolatility::GreyedByExecution,
            Box::new(|heap: &Heap<VM>, visitor: &mut SlotVisitor| {
                heap.protected.visit(visitor);
            }),
        );
        constraints.add(
            "Sh",
            "strong handles",
            ConstraintVolatility::GreyedByExecution,
            Box::new(|heap: &Heap<VM>, visitor: &mut SlotVisitor| {
                for set in heap.handle_sets.lock().unwrap().iter() {
                    set.visit(visitor);
                }
            }),
        );
        constraints.add(
            "Ccr",
            "compiled-code roots",
            ConstraintVolatility::GreyedByExecution,
            Box::new(|heap: &Heap<VM>, visitor: &mut SlotVisitor| {
                heap.vm.scan_code_roots(visitor);
            }),
        );
        constraints.add(
            "Ws",
            "weak set fixup",
            ConstraintVolatility::GreyedByMarking,
            Box::new(|heap: &Heap<VM>, _visitor: &mut SlotVisitor| {
                let populated = heap.weak_handles.fixup();
                trace!("weak fixup: {} populated slots", populated);
            }),
        );
        constraints.add(
            "O",
            "output constraints",
            ConstraintVolatility::GreyedByMarking,
            Box::new(|heap: &Heap<VM>, visitor: &mut SlotVisitor| {
                let cells: Vec<CellRef> = heap.output_cells.lock().unwrap().clone();
                for cell in cells {
                    // Re-examined only while the cell stays black; a barrier
                    // re-gray means ordinary rescanning covers it.
                    if cell.is_marked() && cell.state() == CellState::PossiblyBlack {
                        let constraint = cell
                            .spec()
                            .output_constraint
                            .expect("cell registered without an output constraint");
                        constraint(cell, visitor);
                    }
                }
            }),
        );
        constraints.add(
            "Mrms",
            "merge shared stacks",
            ConstraintVolatility::GreyedByExecution,
            Box::new(|heap: &Heap<VM>, visitor: &mut SlotVisitor| {
                for cell in heap.marking.mutator_stack.drain_all() {
                    visitor.append_for_rescan(cell);
                }
                let raced: Vec<CellRef> = std::mem::take(&mut *heap.marking.race_stack.lock());
                for cell in raced {
                    visitor.append_for_rescan(cell);
                }
            }),
        );
        debug!(
            "installed {} core marking constraints",
            constraints.len()
        );
    }

    // ===== Accessors used across the crate =====

    pub fn vm(&self) -> &VM {
        &self.vm
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn marking(&self) -> &MarkingShared {
        &self.marking
    }

    pub(crate) fn concurrent_epoch(&self) -> u64 {
        self.concurrent_epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn has_collector_work(&self) -> bool {
        self.phase.load(atomic::Ordering::SeqCst) != CollectorPhase::NotRunning
            || self.requests.has_pending()
    }

    fn is_collecting(&self) -> bool {
        self.phase.load(atomic::Ordering::SeqCst) != CollectorPhase::NotRunning
    }

    /// Scope-aware liveness of a cell under the cycle in flight.
    pub fn cell_is_live(&self, cell: CellRef) -> bool {
        let scope = self.global.current_scope.load(atomic::Ordering::SeqCst);
        registry::cell_is_live(cell, scope)
    }

    // ===== Mutator thread registration =====

    /// Take heap access for the calling (mutator) thread. Blocks while the
    /// collector has the world stopped.
    pub fn acquire_access(&self) {
        self.safepoint
            .park_until(|| self.global.world.try_acquire_access());
    }

    /// Give up heap access (before blocking in native code, or exiting). Any
    /// held conn is donated to the collector thread.
    pub fn release_access(&self) {
        self.global.world.release_access();
        self.collector_thread.notify();
    }

    /// The explicit safepoint poll. Drives pending collector work when this
    /// thread holds the conn, and runs the post-cycle epilogue when one is
    /// owed.
    pub fn stop_if_necessary(&self) {
        if self.global.world.mutator_has_conn() {
            self.run_conn_loop(Conductor::Mutator);
        }
        if self.global.world.take_needs_finalize() {
            let scope = self.global.current_scope.load(atomic::Ordering::SeqCst);
            self.vm.did_finish_collection(scope);
        }
    }

    // ===== Allocation =====

    /// Allocate a managed cell with `payload_bytes` of zeroed payload. This
    /// is the allocation slow path: it is a safepoint, it feeds the limit
    /// heuristic, and it pays the marking tax during concurrent cycles.
    pub fn allocate(&self, spec: &'static TypeSpec, payload_bytes: usize) -> CellRef {
        assert!(
            !self.is_shut_down.load(Ordering::SeqCst),
            "allocating after last_chance_to_finalize"
        );
        self.stop_if_necessary();
        self.collect_if_necessary_or_defer();
        self.perform_increment();

        let cell = cell::allocate_cell(spec, payload_bytes);
        if self.is_collecting() {
            // Born black: a cycle in flight treats new cells as live and
            // scanned, so initialization stores need no barrier.
            cell.test_and_set_marked();
            cell.store_state(CellState::PossiblyBlack);
        }
        self.registry.lock().unwrap().add(cell);
        self.growth.did_allocate(cell.size());
        if spec.finalizer.is_some() {
            self.finalizers.add(cell);
        }
        if spec.output_constraint.is_some() {
            self.output_cells.lock().unwrap().push(cell);
        }
        cell
    }

    /// Consult the allocation-limit heuristic and either start an async
    /// collection, record one as owed (inside a deferral region), or do
    /// nothing.
    pub fn collect_if_necessary_or_defer(&self) {
        if self.is_collecting() {
            // The cycle in flight already owns this allocation spike.
            return;
        }
        if !self.growth.should_request_collection() {
            return;
        }
        if self.global.is_deferred() {
            self.global
                .deferred_collection_requested
                .store(true, Ordering::Release);
            return;
        }
        self.collect(Synchronousness::Async, GCRequest::default());
    }

    /// Enter a scoped deferral region.
    pub fn defer_gc(&self) -> DeferGC<'_, VM> {
        self.global.defer_depth.fetch_add(1, Ordering::AcqRel);
        DeferGC { heap: self }
    }

    /// During a concurrent cycle conducted by this mutator, drain a slice of
    /// marking work proportional to the pause budget. No-op otherwise.
    fn perform_increment(&self) {
        if self.phase.load(atomic::Ordering::SeqCst) != CollectorPhase::Concurrent
            || !self.global.world.mutator_has_conn()
        {
            return;
        }
        if let Ok(mut collector) = self.collector.try_lock() {
            let budget = Duration::from_micros(self.options.pause_budget_ms * 500);
            let deadline = Instant::now() + budget;
            collector.visitor.drain_in_parallel_passively(deadline);
        }
    }

    // ===== Collection triggers =====

    /// Enqueue or perform a collection. Async returns as soon as the request
    /// holds a ticket; Sync blocks until that ticket is served. After
    /// shutdown both are ignored.
    pub fn collect(&self, sync: Synchronousness, request: GCRequest) {
        let ticket = match self.requests.enqueue(request) {
            Some(ticket) => ticket,
            None => return,
        };
        if !self.global.world.try_hand_conn_to_mutator() {
            self.collector_thread.notify();
        }
        if sync == Synchronousness::Async {
            return;
        }

        if self.global.world.has_access() {
            // We are the mutator: drive the machine ourselves. The waiting
            // bit tells the pacing policy to stop trading pause time for
            // latency.
            self.global.world.set_mutator_waiting();
            while !self.requests.is_ticket_served(ticket) {
                if self.global.world.mutator_has_conn() {
                    self.run_conn_loop(Conductor::Mutator);
                } else {
                    // Defensive: the conn moved; let the collector finish.
                    self.global.world.clear_mutator_waiting();
                    self.release_access();
                    self.requests.wait_for_ticket(ticket);
                    self.acquire_access();
                    return;
                }
            }
            self.global.world.clear_mutator_waiting();
        } else {
            self.requests.wait_for_ticket(ticket);
        }
    }

    /// Synchronous collection; blocks until served.
    pub fn collect_sync(&self, request: GCRequest) {
        self.collect(Synchronousness::Sync, request);
    }

    /// Asynchronous collection; the collector (or this thread's later polls)
    /// drains it.
    pub fn collect_async(&self, request: GCRequest) {
        self.collect(Synchronousness::Async, request);
    }

    /// Synchronous collection of the given scope, now.
    pub fn collect_now(&self, scope: CollectionScope) {
        self.collect_sync(GCRequest { scope: Some(scope) });
    }

    /// Full collection unless one completed within the staleness window.
    /// Returns whether a collection ran.
    pub fn collect_now_full_if_not_done_recently(&self) -> bool {
        let staleness = Duration::from_millis(self.options.full_collection_staleness_ms);
        let recent = self
            .last_full_collection
            .lock()
            .unwrap()
            .map(|at| at.elapsed() < staleness)
            .unwrap_or(false);
        if recent {
            return false;
        }
        self.collect_now(CollectionScope::Full);
        true
    }

    // ===== Write barrier =====

    /// The barrier fast path; call after every managed reference store into
    /// `owner`.
    #[inline(always)]
    pub fn write_barrier(&self, owner: CellRef) {
        self.barrier.on_reference_store(owner);
    }

    /// The out-of-line barrier slow path, for VMs that inline their own fast
    /// path check.
    pub fn write_barrier_slow_path(&self, owner: CellRef) {
        self.barrier.slow_path(owner);
    }

    // ===== Off-heap accounting =====

    /// Attribute `bytes` of off-heap memory to `cell`. If a full cycle is in
    /// flight and the cell is already black, the memory is re-attributed as
    /// visited (the cycle's live size) rather than as fresh allocation, so it
    /// is not double-counted against the allowance mid-cycle.
    pub fn report_extra_memory_allocated(&self, cell: CellRef, bytes: usize) {
        let full_in_flight = self.is_collecting()
            && self.global.current_scope.load(atomic::Ordering::SeqCst) == CollectionScope::Full;
        if full_in_flight && cell.is_marked() && cell.state() == CellState::PossiblyBlack {
            self.marking
                .extra_bytes_visited
                .fetch_add(bytes, Ordering::SeqCst);
        } else {
            self.growth.report_extra_memory(bytes);
        }
        self.collect_if_necessary_or_defer();
    }

    /// Off-heap accounting with no owning cell. Prefer
    /// `report_extra_memory_allocated`.
    pub fn deprecated_report_extra_memory(&self, bytes: usize) {
        self.growth.report_extra_memory(bytes);
        self.collect_if_necessary_or_defer();
    }

    /// The embedder's memory-pressure signal: while set, the allocation
    /// allowance shrinks and collection comes sooner. Not an error and never
    /// fails an allocation.
    pub fn set_memory_pressure(&self, critical: bool) {
        self.growth.set_critical_memory(critical);
    }

    /// An external block allocator committed `bytes`.
    pub fn did_allocate_block(&self, bytes: usize) {
        self.block_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// An external block allocator released `bytes`.
    pub fn did_free_block(&self, bytes: usize) {
        let prev = self.block_bytes.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "freeing more block bytes than allocated");
    }

    // ===== Roots, weaks, finalization =====

    /// Strong-root registration independent of the object graph. Counted:
    /// protect twice, unprotect twice.
    pub fn protect(&self, cell: CellRef) {
        self.protected.protect(cell);
    }

    pub fn unprotect(&self, cell: CellRef) -> bool {
        self.protected.unprotect(cell)
    }

    /// Create a named strong handle set scanned as roots every cycle.
    pub fn new_handle_set(&self, name: &'static str) -> Arc<HandleSet> {
        let set = Arc::new(HandleSet::new(name));
        self.handle_sets.lock().unwrap().push(set.clone());
        set
    }

    /// Create a weak handle. The referent may be reclaimed; `on_death` runs
    /// exactly once when it is.
    pub fn make_weak(
        &self,
        referent: CellRef,
        on_death: Option<Box<dyn FnOnce() + Send>>,
    ) -> WeakRef {
        self.weak_handles.make(referent, on_death)
    }

    /// The weak handle's referent, or `None` once reaped.
    pub fn weak_target(&self, weak: WeakRef) -> Option<CellRef> {
        self.weak_handles.get(weak)
    }

    pub fn release_weak(&self, weak: WeakRef) {
        self.weak_handles.release(weak);
    }

    /// Register an auxiliary weak table for stale-entry pruning on full
    /// collections.
    pub fn register_weak_table(&self, table: Arc<dyn WeakTable>) {
        self.weak_tables.lock().unwrap().push(table);
    }

    /// Track off-thread work holding unrooted cell references; it is
    /// cancelled if any of them dies first.
    pub fn register_deferred_work(
        &self,
        cells: Vec<CellRef>,
        on_cancel: Box<dyn FnOnce() + Send>,
    ) -> DeferredWorkId {
        self.deferred_work.register(cells, on_cancel)
    }

    pub fn complete_deferred_work(&self, id: DeferredWorkId) {
        self.deferred_work.complete(id);
    }

    // ===== Introspection =====

    /// Live bytes the collector knows about: precise allocations plus
    /// reported extra memory.
    pub fn size(&self) -> usize {
        self.registry.lock().unwrap().total_bytes() + self.growth.extra_memory_size()
    }

    /// Committed bytes: precise allocations, block-allocator commitments and
    /// extra memory.
    pub fn capacity(&self) -> usize {
        self.registry.lock().unwrap().total_bytes()
            + self.block_bytes.load(Ordering::Relaxed)
            + self.growth.extra_memory_size()
    }

    pub fn object_count(&self) -> usize {
        self.registry.lock().unwrap().object_count()
    }

    pub fn statistics(&self) -> HeapStatistics {
        self.stats.snapshot(
            self.global.cycle_count.load(Ordering::SeqCst),
            self.global.full_cycle_count.load(Ordering::SeqCst),
            self.pacing.marking_rate(),
        )
    }

    // ===== Shutdown =====

    /// Terminal, synchronous drain. Waits out every outstanding ticket,
    /// forbids new collections, joins the collector and marker threads, then
    /// force-sweeps everything (weak handles reaped, deferred work
    /// cancelled, destroy callbacks run). The heap accepts nothing afterwards
    /// except introspection.
    pub fn last_chance_to_finalize(&self) {
        assert!(
            !self.is_shut_down.swap(true, Ordering::SeqCst),
            "last_chance_to_finalize called twice"
        );

        // Serve everything already promised before forbidding more.
        if self.global.world.has_access() {
            self.release_access();
        }
        let final_ticket = self.requests.last_granted();
        self.requests.wait_for_ticket(final_ticket);
        self.safepoint
            .park_until(|| self.phase.load(atomic::Ordering::SeqCst) == CollectorPhase::NotRunning);

        let last = self.requests.forbid_new_requests();
        assert_eq!(last, final_ticket, "a request slipped in during shutdown");

        self.collector_thread.request_shutdown_and_join();
        self.marker_pool.shutdown(&self.marking);
        assert_eq!(
            self.phase.load(atomic::Ordering::SeqCst),
            CollectorPhase::NotRunning,
            "collector thread exited mid-cycle"
        );

        // Forced finalization drain: everything is dead now.
        self.marking.mutator_stack.drain_all();
        self.marking.collector_stack.drain_all();
        self.marking.race_stack.lock().clear();
        self.collector.lock().unwrap().visitor.abandon();

        let reaped = self.weak_handles.reap(|_| false);
        let cancelled = self.deferred_work.cancel_dead(|_| false);
        self.finalizers.clear();
        self.output_cells.lock().unwrap().clear();
        let tally = self.registry.lock().unwrap().sweep_everything();
        self.weak_handles.clear();
        self.deferred_work.clear();

        info!(
            "heap shut down: swept {} cells ({} bytes), reaped {} weaks, cancelled {} deferred",
            tally.swept_cells, tally.swept_bytes, reaped, cancelled
        );
    }

    /// Whether `last_chance_to_finalize` has run.
    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::SeqCst)
    }

    // ===== Test-only windows =====

    /// The most recently granted request ticket.
    #[cfg(any(test, feature = "test_private"))]
    pub fn debug_last_granted_ticket(&self) -> u64 {
        self.requests.last_granted()
    }

    /// The current phase, for assertions.
    #[cfg(any(test, feature = "test_private"))]
    pub fn debug_phase(&self) -> CollectorPhase {
        self.phase.load(atomic::Ordering::SeqCst)
    }
}
